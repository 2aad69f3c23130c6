use std::path::PathBuf;

use clap::Parser;

use crate::cache::{clamp_cache_timeout, DEFAULT_CACHE_TIMEOUT};

const DEFAULT_PORT: u16 = 21;
const DEFAULT_USER: &str = "anonymous";
const DEFAULT_ENCODING: &str = "utf-8";
const VSCODE_CACHE_TIMEOUT: u64 = 60;

/// Mount a remote FTP server as a local FUSE filesystem.
#[derive(Parser, Debug)]
#[command(name = "cftpfs", version, about)]
pub struct Cli {
    /// FTP server hostname or address
    pub host: String,

    /// Local directory to mount the filesystem at
    pub mountpoint: PathBuf,

    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(short = 'u', long = "user", default_value = DEFAULT_USER)]
    pub user: String,

    #[arg(short = 'P', long = "password", default_value = "")]
    pub password: String,

    #[arg(short = 'e', long = "encoding", default_value = DEFAULT_ENCODING)]
    pub encoding: String,

    #[arg(short = 'c', long = "cache-timeout", default_value_t = DEFAULT_CACHE_TIMEOUT)]
    pub cache_timeout: u64,

    /// Shorthand for editors that poll aggressively: raises the cache
    /// timeout to 60s regardless of `--cache-timeout`.
    #[arg(long = "vscode")]
    pub vscode: bool,

    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,
}

impl Cli {
    pub fn effective_cache_timeout(&self) -> u64 {
        if self.vscode {
            return VSCODE_CACHE_TIMEOUT;
        }
        clamp_cache_timeout(self.cache_timeout)
    }
}
