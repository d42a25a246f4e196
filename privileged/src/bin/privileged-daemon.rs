use clap::Parser;
use privileged::{daemon, dispatch, modules, Config, Error, Server};
use privileged_log::{error, info};
use std::{path::PathBuf, process};
use tokio::signal::unix::{signal, SignalKind};

/// Serve privileged actions on a Unix socket.
#[derive(Debug, Parser)]
#[command(name = "privileged-daemon", version)]
struct Args {
    /// Configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::read(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("privileged-daemon: {}", err);
            process::exit(dispatch::EXIT_FAILURE);
        }
    };
    let guard = match config.logger("privileged-daemon").await {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("privileged-daemon: failed to set up logging: {}", err);
            process::exit(dispatch::EXIT_FAILURE);
        }
    };

    info!("Privileged daemon {}", env!("CARGO_PKG_VERSION"));
    let code = match run(&config).await {
        Ok(()) => 0,
        Err(err) => {
            error!("Privileged daemon exiting on error - {}", err);
            dispatch::EXIT_FAILURE
        }
    };

    drop(guard);
    process::exit(code);
}

async fn run(config: &Config) -> Result<(), Error> {
    dispatch::require_root()?;

    let server = Server::from_config(config, modules::registry(config))?;
    let mut sigterm = signal(SignalKind::terminate())?;
    daemon::notify_ready()?;

    server
        .serve(async move {
            sigterm.recv().await;
            info!("SIGTERM received, shutting down the server");
        })
        .await
}
