//! The process-wide context: built once from parsed CLI arguments, handed
//! to the filesystem bridge as an `Arc`, torn down after it returns. Three
//! independent mutexes — ftp, cache, handles — are what actually serialize
//! access, since the dispatcher itself only ever holds a shared reference.

use std::path::PathBuf;
use std::sync::Mutex;

use crate::cache::DirectoryCache;
use crate::ftp_ops::{ConnectionSettings, FtpBackend, SuppaftpBackend};
use crate::handles::HandleTable;
use crate::inodes::InodeTable;

pub struct Context<B: FtpBackend = SuppaftpBackend> {
    pub ftp: Mutex<B>,
    pub cache: Mutex<DirectoryCache>,
    pub handles: Mutex<HandleTable>,
    pub inodes: Mutex<InodeTable>,
    pub staging_dir: PathBuf,
    pub cache_timeout: u64,
    pub uid: u32,
    pub gid: u32,
}

impl Context<SuppaftpBackend> {
    pub fn new(settings: ConnectionSettings, cache_timeout: u64) -> std::io::Result<Self> {
        let staging_dir = staging_dir_path();
        std::fs::create_dir_all(&staging_dir)?;
        restrict_to_owner(&staging_dir)?;
        Ok(Context {
            ftp: Mutex::new(SuppaftpBackend::new(settings)),
            cache: Mutex::new(DirectoryCache::new(cache_timeout)),
            handles: Mutex::new(HandleTable::new(staging_dir.clone())),
            inodes: Mutex::new(InodeTable::new()),
            staging_dir,
            cache_timeout,
            uid: current_uid(),
            gid: current_gid(),
        })
    }
}

impl<B: FtpBackend> Context<B> {
    #[cfg(test)]
    pub fn with_backend(backend: B, cache_timeout: u64, staging_dir: PathBuf) -> Self {
        Context {
            ftp: Mutex::new(backend),
            cache: Mutex::new(DirectoryCache::new(cache_timeout)),
            handles: Mutex::new(HandleTable::new(staging_dir.clone())),
            inodes: Mutex::new(InodeTable::new()),
            staging_dir,
            cache_timeout,
            uid: 0,
            gid: 0,
        }
    }

    /// Recursively removes the staging directory. Called from `destroy`.
    pub fn shutdown(&self) {
        if let Err(err) = std::fs::remove_dir_all(&self.staging_dir) {
            tracing::warn!(
                path = %self.staging_dir.display(),
                %err,
                "failed to remove staging directory"
            );
        }
    }
}

fn staging_dir_path() -> PathBuf {
    let pid = std::process::id();
    let started = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    std::env::temp_dir().join(format!("cftpfs_{}_{}", pid, started))
}

#[cfg(unix)]
fn restrict_to_owner(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(unix)]
fn current_gid() -> u32 {
    unsafe { libc::getgid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(not(unix))]
fn current_gid() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp_ops::fake::FakeBackend;

    #[test]
    fn shutdown_removes_the_staging_directory() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let ctx = Context::with_backend(FakeBackend::new(), 30, staging.clone());
        assert!(staging.exists());
        ctx.shutdown();
        assert!(!staging.exists());
    }
}
