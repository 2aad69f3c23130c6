mod cache;
mod cli;
mod context;
mod errors;
mod filesystem;
mod ftp_ops;
mod handles;
mod inodes;
mod listing;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fuser::MountOption;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use context::Context;
use filesystem::Dispatcher;
use ftp_ops::ConnectionSettings;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::from(1);
        }
    };

    init_logging(cli.debug);

    let settings = ConnectionSettings {
        host: cli.host.clone(),
        port: cli.port,
        user: cli.user.clone(),
        password: cli.password.clone(),
    };
    let cache_timeout = cli.effective_cache_timeout();

    let ctx = match Context::new(settings, cache_timeout) {
        Ok(ctx) => Arc::new(ctx),
        Err(err) => {
            eprintln!("cftpfs: failed to prepare staging directory: {}", err);
            return ExitCode::from(1);
        }
    };

    if !cli.foreground {
        if let Err(err) = daemonize::Daemonize::new().start() {
            eprintln!("cftpfs: failed to daemonize: {}", err);
            return ExitCode::from(1);
        }
    }

    let dispatcher = Dispatcher::new(ctx.clone());
    let options = vec![
        MountOption::FSName("cftpfs".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];

    let result = fuser::mount2(dispatcher, &cli.mountpoint, &options);
    ctx.shutdown();

    match result {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            tracing::error!(%err, "mount failed");
            ExitCode::from(1)
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
