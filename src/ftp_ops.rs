//! Wraps a lazily-connected `suppaftp::FtpStream` with the operation set the
//! dispatcher needs: list/download/upload/delete/mkdir/rmdir/rename.

use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use socket2::{SockRef, TcpKeepalive};
use suppaftp::types::FileType as FtpFileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::{debug, warn};

use crate::errors::CftpfsError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(300);
const KEEPALIVE_IDLE: Duration = Duration::from_secs(120);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Leaves `/` untouched so callers can encode one path component at a time
/// and join the pieces back with `/`.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'?').add(b'#').add(b'%');

pub fn encode_path_component(component: &str) -> String {
    utf8_percent_encode(component, PATH_ENCODE_SET).to_string()
}

pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(encode_path_component)
        .collect::<Vec<_>>()
        .join("/")
}

/// The operation set the dispatcher composes under the FTP lock. Extracted
/// as a trait so dispatcher-level tests can substitute an in-process fake
/// instead of talking to a live server.
pub trait FtpBackend: Send {
    fn list(&mut self, path: &str) -> Result<Vec<String>, CftpfsError>;
    fn download(&mut self, remote: &str, local: &Path) -> Result<(), CftpfsError>;
    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), CftpfsError>;
    fn delete(&mut self, path: &str) -> Result<(), CftpfsError>;
    fn mkdir(&mut self, path: &str) -> Result<(), CftpfsError>;
    fn rmdir(&mut self, path: &str) -> Result<(), CftpfsError>;
    fn rename(&mut self, old: &str, new: &str) -> Result<(), CftpfsError>;
}

pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

pub struct SuppaftpBackend {
    settings: ConnectionSettings,
    stream: Option<FtpStream>,
}

impl SuppaftpBackend {
    pub fn new(settings: ConnectionSettings) -> Self {
        SuppaftpBackend {
            settings,
            stream: None,
        }
    }

    fn ensure_session(&mut self) -> Result<&mut FtpStream, CftpfsError> {
        if self.stream.is_none() {
            let addr = format!("{}:{}", self.settings.host, self.settings.port);
            debug!(%addr, "connecting to ftp server");
            let mut stream = FtpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
            apply_socket_tuning(&stream);
            stream.set_mode(Mode::Passive);
            stream.login(&self.settings.user, &self.settings.password)?;
            stream.transfer_type(FtpFileType::Binary)?;
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("session was just ensured"))
    }

    fn teardown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.quit();
        }
    }

    /// Runs `op` against the current session, tearing the session down on a
    /// connection-class failure so the next call reconnects. Other failures
    /// leave the session up.
    fn run<T>(
        &mut self,
        op: impl FnOnce(&mut FtpStream) -> Result<T, CftpfsError>,
    ) -> Result<T, CftpfsError> {
        let stream = self.ensure_session()?;
        match op(stream) {
            Ok(value) => Ok(value),
            Err(err) => {
                if is_connection_class(&err) {
                    warn!("ftp session torn down after connection-class failure");
                    self.teardown();
                }
                Err(err)
            }
        }
    }

    /// `suppaftp` has no "create missing directories" flag, so uploads walk
    /// and `mkdir` every parent component first, swallowing failures (most
    /// commonly "already exists").
    fn ensure_parent_dirs(&mut self, remote: &str) -> Result<(), CftpfsError> {
        let parent = match remote.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => parent.to_string(),
            _ => return Ok(()),
        };
        self.run(move |stream| {
            let mut acc = String::new();
            for component in parent.split('/').filter(|c| !c.is_empty()) {
                acc.push('/');
                acc.push_str(component);
                let _ = stream.mkdir(&encode_path(&acc));
            }
            Ok(())
        })
    }
}

fn is_connection_class(err: &CftpfsError) -> bool {
    matches!(
        err,
        CftpfsError::Connection(_) | CftpfsError::FtpCommand(FtpError::ConnectionError(_))
    )
}

fn apply_socket_tuning(stream: &FtpStream) {
    let sock = SockRef::from(stream.get_ref());
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
        warn!(%err, "failed to configure tcp keepalive on ftp control connection");
    }
    let _ = stream.get_ref().set_read_timeout(Some(OPERATION_TIMEOUT));
    let _ = stream.get_ref().set_write_timeout(Some(OPERATION_TIMEOUT));
}

/// `MULTICWD`: one `CWD` per path component, for maximum server
/// compatibility when listing.
fn walk_multicwd(stream: &mut FtpStream, path: &str) -> Result<(), CftpfsError> {
    stream.cwd("/")?;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        stream.cwd(&encode_path_component(component))?;
    }
    Ok(())
}

impl FtpBackend for SuppaftpBackend {
    fn list(&mut self, path: &str) -> Result<Vec<String>, CftpfsError> {
        let path = path.to_string();
        self.run(move |stream| {
            walk_multicwd(stream, &path)?;
            Ok(stream.list(None)?)
        })
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<(), CftpfsError> {
        // NOCWD: the whole remote path goes out in a single command.
        let remote_enc = encode_path(remote);
        let data = self.run(move |stream| {
            let mut cursor = stream.retr_as_buffer(&remote_enc)?;
            let mut buf = Vec::new();
            cursor.read_to_end(&mut buf)?;
            Ok(buf)
        })?;
        std::fs::write(local, &data)?;
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), CftpfsError> {
        self.ensure_parent_dirs(remote)?;
        let remote_enc = encode_path(remote);
        let mut file = std::fs::File::open(local)?;
        self.run(move |stream| {
            stream.put_file(&remote_enc, &mut file)?;
            Ok(())
        })
    }

    fn delete(&mut self, path: &str) -> Result<(), CftpfsError> {
        let enc = encode_path(path);
        self.run(move |stream| {
            stream.rm(&enc)?;
            Ok(())
        })
    }

    fn mkdir(&mut self, path: &str) -> Result<(), CftpfsError> {
        let enc = encode_path(path);
        self.run(move |stream| {
            stream.mkdir(&enc)?;
            Ok(())
        })
    }

    fn rmdir(&mut self, path: &str) -> Result<(), CftpfsError> {
        let enc = encode_path(path);
        self.run(move |stream| {
            stream.rmdir(&enc)?;
            Ok(())
        })
    }

    fn rename(&mut self, old: &str, new: &str) -> Result<(), CftpfsError> {
        let old_enc = encode_path(old);
        let new_enc = encode_path(new);
        self.run(move |stream| {
            stream.rename(&old_enc, &new_enc)?;
            Ok(())
        })
    }
}

/// An in-process stand-in for [`SuppaftpBackend`] used by dispatcher tests
/// that have no live FTP server fixture to talk to.
#[cfg(test)]
pub mod fake {
    use super::FtpBackend;
    use crate::errors::CftpfsError;
    use std::collections::HashMap;
    use std::path::Path;

    #[derive(Clone)]
    pub enum FakeNode {
        File(Vec<u8>),
        Dir,
    }

    #[derive(Default)]
    pub struct FakeBackend {
        pub nodes: HashMap<String, FakeNode>,
        pub list_responses: HashMap<String, Vec<String>>,
        pub fail_next_list: bool,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl FtpBackend for FakeBackend {
        fn list(&mut self, path: &str) -> Result<Vec<String>, CftpfsError> {
            if self.fail_next_list {
                self.fail_next_list = false;
                return Err(CftpfsError::Connection(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "simulated network flap",
                )));
            }
            self.list_responses
                .get(path)
                .cloned()
                .ok_or(CftpfsError::NotFound)
        }

        fn download(&mut self, remote: &str, local: &Path) -> Result<(), CftpfsError> {
            match self.nodes.get(remote) {
                Some(FakeNode::File(data)) => {
                    std::fs::write(local, data)?;
                    Ok(())
                }
                _ => Err(CftpfsError::NotFound),
            }
        }

        fn upload(&mut self, local: &Path, remote: &str) -> Result<(), CftpfsError> {
            let data = std::fs::read(local)?;
            self.nodes.insert(remote.to_string(), FakeNode::File(data));
            Ok(())
        }

        fn delete(&mut self, path: &str) -> Result<(), CftpfsError> {
            self.nodes.remove(path);
            Ok(())
        }

        fn mkdir(&mut self, path: &str) -> Result<(), CftpfsError> {
            self.nodes.insert(path.to_string(), FakeNode::Dir);
            Ok(())
        }

        fn rmdir(&mut self, path: &str) -> Result<(), CftpfsError> {
            self.nodes.remove(path);
            Ok(())
        }

        fn rename(&mut self, old: &str, new: &str) -> Result<(), CftpfsError> {
            match self.nodes.remove(old) {
                Some(node) => {
                    self.nodes.insert(new.to_string(), node);
                    Ok(())
                }
                None => Err(CftpfsError::NotFound),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_path_component_escapes_spaces_and_preserves_slashes() {
        assert_eq!(encode_path_component("my file.txt"), "my%20file.txt");
        assert_eq!(encode_path("/a b/c"), "/a%20b/c");
    }

    #[test]
    fn encode_path_leaves_plain_ascii_alone() {
        assert_eq!(encode_path("/usr/local/bin"), "/usr/local/bin");
    }
}
