use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use unpackd::config::{load_config, resolve_var_dir, Config};
use unpackd::logging::{self, LogFormat};
use unpackd::{reconcile_on_boot, Dispatcher, JobStore, ProcessRunner, UnpackdError, WorkerError};

#[derive(Parser)]
#[command(name = "unpackd")]
#[command(about = "Resumable batch archive extraction worker")]
#[command(version)]
struct Args {
    /// JSON config file; built-in defaults apply without one
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding data/unpackd.db and logs/
    #[arg(long)]
    var_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init(args.log_format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), UnpackdError> {
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    let var_dir = resolve_var_dir(&config, args.var_dir.as_deref())?;
    info!("Using var directory {}", var_dir.display());

    let store = JobStore::open(&var_dir, config.retry_policy())?;
    reconcile_on_boot(&store)?;

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        Arc::new(ProcessRunner::new(config.extract_timeout())),
        Arc::new(config.tool_resolver()),
        config.dispatcher_config(),
    ));

    let stopper = Arc::clone(&dispatcher);
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        stopper.stop();
    })?;

    dispatcher
        .start()
        .join()
        .map_err(|_| WorkerError::Panicked)??;
    Ok(())
}
