mod args;
mod modes;
mod rows;

use std::process::ExitCode;

use clap::Parser;
use dispatchq_infra::{ConfigError, DispatchConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    dispatchq_observability::init(args.log_format, args.verbose);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::from(2);
        }
    };
    info!(
        mode = ?args.mode,
        workers = config.workers,
        timezone = %config.timezone,
        queue = %config.queue_name,
        dry_run = config.dry_run,
        "starting"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "cannot listen for ctrl-c");
                return;
            }
            info!("interrupted, shutting down");
            cancel.cancel();
        });
    }

    let report_every = args.report_interval();
    match modes::run(args.mode, config, report_every, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let chain = format!("{error:#}");
            error!(error = %chain, "run failed");
            ExitCode::FAILURE
        }
    }
}

/// Defaults, then environment, then flags.
fn load_config(args: &Args) -> Result<DispatchConfig, ConfigError> {
    let mut config = DispatchConfig::from_env()?;
    args.apply(&mut config);
    if args.mode.submits() {
        config.validate_for_submission()?;
    } else {
        config.validate()?;
    }
    Ok(config)
}
