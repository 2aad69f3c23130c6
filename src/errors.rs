use std::io;

use thiserror::Error;

/// Internal error type. Every fallible function below the `Filesystem` trait
/// boundary returns this; it is converted to a raw errno exactly once, at the
/// point a `reply.error(..)` is sent.
#[derive(Debug, Error)]
pub enum CftpfsError {
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),

    #[error("ftp command failed: {0}")]
    FtpCommand(#[source] suppaftp::FtpError),

    #[error("no such file")]
    NotFound,

    #[error("too many open files")]
    TooManyHandles,

    #[error("bad file descriptor")]
    BadHandle,

    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for CftpfsError {
    fn from(err: io::Error) -> Self {
        CftpfsError::Io(err)
    }
}

impl From<suppaftp::FtpError> for CftpfsError {
    fn from(err: suppaftp::FtpError) -> Self {
        CftpfsError::FtpCommand(err)
    }
}

impl CftpfsError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            CftpfsError::Connection(_) => libc::EIO,
            CftpfsError::FtpCommand(_) => libc::EIO,
            CftpfsError::NotFound => libc::ENOENT,
            CftpfsError::TooManyHandles => libc::EMFILE,
            CftpfsError::BadHandle => libc::EBADF,
            CftpfsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_enoent() {
        assert_eq!(CftpfsError::NotFound.errno(), libc::ENOENT);
    }

    #[test]
    fn too_many_handles_maps_to_emfile() {
        assert_eq!(CftpfsError::TooManyHandles.errno(), libc::EMFILE);
    }

    #[test]
    fn bad_handle_maps_to_ebadf() {
        assert_eq!(CftpfsError::BadHandle.errno(), libc::EBADF);
    }

    #[test]
    fn io_error_preserves_raw_os_error_when_present() {
        let err = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(CftpfsError::from(err).errno(), libc::ENOSPC);
    }
}
