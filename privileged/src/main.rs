use clap::Parser;
use privileged::{config::LogConfig, dispatch, modules, Config};
use privileged_log::error;
use std::{io, path::PathBuf, process};

/// Run a privileged action with the JSON arguments read from stdin.
#[derive(Debug, Parser)]
#[command(name = dispatch::PROGRAM, version)]
struct Args {
    /// Module that provides the action.
    module: String,
    /// Name of the action to run.
    action: String,
    /// Do not read arguments from stdin.
    #[arg(long)]
    no_args: bool,
    /// Configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    let config = Config::read(args.config.as_deref());

    // Diagnostics always go to stderr, the caller reads them from there.
    let log = LogConfig {
        foreground: true,
        filter: config
            .as_ref()
            .ok()
            .and_then(|config| config.log.filter.clone()),
    };
    let guard = match privileged_log::sync_logger(dispatch::PROGRAM, log) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{}: failed to set up logging: {}", dispatch::PROGRAM, err);
            process::exit(dispatch::EXIT_FAILURE);
        }
    };

    let code = if let Err(err) = dispatch::require_root() {
        error!("This action is reserved for root");
        dispatch::exit_code(&err)
    } else {
        match config {
            Ok(config) => dispatch::run(
                &modules::registry(&config),
                &args.module,
                &args.action,
                args.no_args,
                io::stdin().lock(),
                io::stdout().lock(),
            ),
            Err(err) => {
                error!("{}", err);
                dispatch::EXIT_FAILURE
            }
        }
    };

    // Flush the logger before exiting.
    drop(guard);
    process::exit(code);
}
