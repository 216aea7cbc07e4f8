use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dispatchq_core::{parse_timezone, Tz};
use dispatchq_infra::DispatchConfig;
use dispatchq_observability::LogFormat;

/// Scheduled job dispatch with retries and a durable priority queue.
///
/// Settings not given on the command line come from `DISPATCHQ_*`
/// environment variables.
#[derive(Parser, Debug)]
#[command(name = "dispatchq", about, long_about = None, version)]
pub(crate) struct Args {
    #[command(subcommand)]
    pub(crate) mode: Mode,
    /// Number of concurrent workers.
    #[arg(short, long, global = true)]
    pub(crate) workers: Option<usize>,
    /// Queue broker URL.
    #[arg(long, global = true)]
    pub(crate) queue_url: Option<String>,
    /// Queue name (stream key prefix).
    #[arg(long, global = true)]
    pub(crate) queue_name: Option<String>,
    /// IANA timezone the ETAs are written in.
    #[arg(long, global = true, value_parser = timezone)]
    pub(crate) timezone: Option<Tz>,
    /// Attempts per job, including the first.
    #[arg(long, global = true)]
    pub(crate) max_attempts: Option<u32>,
    /// URL the form fields are posted to.
    #[arg(long, global = true)]
    pub(crate) submit_url: Option<String>,
    /// Log each submission instead of performing it.
    #[arg(long, global = true, default_value_t)]
    pub(crate) dry_run: bool,
    /// Log statistics every SECS seconds while running.
    #[arg(long, global = true, value_name = "SECS")]
    pub(crate) report_every: Option<u64>,
    /// Enables debug logging.
    #[arg(short, long, global = true, default_value_t)]
    pub(crate) verbose: bool,
    /// Log output format (json or pretty).
    #[arg(long, global = true, default_value_t)]
    pub(crate) log_format: LogFormat,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Submit every row right away, without a queue.
    Batch {
        /// JSON array or JSON Lines file of rows.
        #[arg(long, value_name = "FILE")]
        rows: PathBuf,
    },
    /// Dispatch rows at their ETA.
    Scheduled {
        /// JSON array or JSON Lines file of rows.
        #[arg(long, value_name = "FILE")]
        rows: PathBuf,
        /// Feed due jobs straight to local workers instead of the queue.
        #[arg(long, default_value_t)]
        no_queue: bool,
    },
    /// Drain the queue until interrupted.
    #[command(alias = "consumer")]
    Worker,
    /// Print queue depth.
    Status,
    /// Remove every ready message from the queue.
    Purge,
}

impl Mode {
    /// Whether this mode submits jobs (and so needs a target).
    pub(crate) fn submits(&self) -> bool {
        matches!(self, Mode::Batch { .. } | Mode::Scheduled { .. } | Mode::Worker)
    }
}

impl Args {
    /// Overlay command-line settings on `config`.
    pub(crate) fn apply(&self, config: &mut DispatchConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(url) = &self.queue_url {
            config.queue_url = url.clone();
        }
        if let Some(name) = &self.queue_name {
            config.queue_name = name.clone();
        }
        if let Some(tz) = self.timezone {
            config.timezone = tz;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(url) = &self.submit_url {
            config.submit_url = Some(url.clone());
        }
        if self.dry_run {
            config.dry_run = true;
        }
    }

    pub(crate) fn report_interval(&self) -> Option<Duration> {
        self.report_every
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn timezone(name: &str) -> Result<Tz, String> {
    parse_timezone(name).map_err(|e| e.to_string())
}
