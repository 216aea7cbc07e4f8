use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dispatchq_core::{ingest_rows, IngestedRow, Job, JobId};
use dispatchq_infra::queue::{Broker, RedisStreamsBroker};
use dispatchq_infra::submit::HttpFormSubmitter;
use dispatchq_infra::{
    DirectDispatcher, DispatchConfig, DispatchError, DryRunSubmitter, EtaScheduler, JobProcessor,
    JobSink, QueueAdapter, ScheduleReport, Stats, StatsSnapshot, Submitter, WorkerPool,
    WorkerPoolConfig,
};

use crate::args::Mode;
use crate::rows::read_rows;

type Adapter = QueueAdapter<RedisStreamsBroker>;

pub(crate) async fn run(
    mode: Mode,
    config: DispatchConfig,
    report_every: Option<Duration>,
    cancel: CancellationToken,
) -> Result<()> {
    match mode {
        Mode::Batch { rows } => batch(&config, &rows, report_every, cancel).await,
        Mode::Scheduled {
            rows,
            no_queue: true,
        } => scheduled_direct(&config, &rows, report_every, cancel).await,
        Mode::Scheduled {
            rows,
            no_queue: false,
        } => scheduled_queued(&config, &rows, report_every, cancel).await,
        Mode::Worker => worker(&config, report_every, cancel).await,
        Mode::Status => status(&config).await,
        Mode::Purge => purge(&config).await,
    }
}

async fn batch(
    config: &DispatchConfig,
    rows: &Path,
    report_every: Option<Duration>,
    cancel: CancellationToken,
) -> Result<()> {
    let jobs = load_jobs(rows, config)?;
    let stats = Arc::new(Stats::new());
    let direct = DirectDispatcher::new(processor(config, stats.clone())?, config.workers, cancel);

    let reporter = Reporter::start(stats.clone(), report_every);
    direct.run_batch(jobs).await;
    reporter.stop().await;

    finish(&stats)
}

async fn scheduled_direct(
    config: &DispatchConfig,
    rows: &Path,
    report_every: Option<Duration>,
    cancel: CancellationToken,
) -> Result<()> {
    let jobs = load_jobs(rows, config)?;
    let stats = Arc::new(Stats::new());
    let direct = DirectDispatcher::new(
        processor(config, stats.clone())?,
        config.workers,
        cancel.clone(),
    );

    let reporter = Reporter::start(stats.clone(), report_every);
    let mut scheduler = EtaScheduler::with_stop(config.scheduler_config(), cancel);
    scheduler.load(jobs);
    let report = scheduler.run(&direct).await;
    direct.join().await;
    reporter.stop().await;

    log_report(&report);
    finish(&stats)
}

async fn scheduled_queued(
    config: &DispatchConfig,
    rows: &Path,
    report_every: Option<Duration>,
    cancel: CancellationToken,
) -> Result<()> {
    let jobs = load_jobs(rows, config)?;
    // A queue of its own, so consumers of other runs never take these jobs.
    let queue = run_queue(&config.queue_name);
    let adapter = connect(config, &queue).await?;
    info!(%queue, "run queue ready");
    let stats = Arc::new(Stats::new());

    let pool = WorkerPool::new(
        adapter.clone(),
        processor(config, stats.clone())?,
        WorkerPoolConfig::default().with_workers(config.workers),
    )
    .spawn(cancel.child_token());
    let reporter = Reporter::start(stats.clone(), report_every);

    let mut scheduler = EtaScheduler::with_stop(config.scheduler_config(), cancel.clone());
    scheduler.load(jobs);
    let sink = Published::new(adapter.as_ref());
    let report = scheduler.run(&sink).await;

    if !cancel.is_cancelled() {
        let published = sink.into_ids();
        info!(published = published.len(), "all jobs published, waiting for workers");
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = stats.wait_for_jobs(&published) => {}
        }
    }
    if cancel.is_cancelled() {
        warn!(%queue, "interrupted, unfinished jobs stay in the run queue");
    }
    pool.shutdown().await;
    reporter.stop().await;

    log_report(&report);
    finish(&stats)
}

async fn worker(
    config: &DispatchConfig,
    report_every: Option<Duration>,
    cancel: CancellationToken,
) -> Result<()> {
    let adapter = connect(config, &config.queue_name).await?;
    let stats = Arc::new(Stats::new());

    let pool = WorkerPool::new(
        adapter,
        processor(config, stats.clone())?,
        WorkerPoolConfig::default().with_workers(config.workers),
    )
    .spawn(cancel);
    let reporter = Reporter::start(stats.clone(), report_every);
    pool.join().await;
    reporter.stop().await;

    finish(&stats)
}

async fn status(config: &DispatchConfig) -> Result<()> {
    let adapter = connect(config, &config.queue_name).await?;
    let depth = adapter.depth().await.context("reading queue depth")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "queue": config.queue_name, "depth": depth }))?
    );
    Ok(())
}

async fn purge(config: &DispatchConfig) -> Result<()> {
    let adapter = connect(config, &config.queue_name).await?;
    let purged = adapter.purge().await.context("purging queue")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "queue": config.queue_name, "purged": purged }))?
    );
    Ok(())
}

async fn connect(config: &DispatchConfig, queue: &str) -> Result<Arc<Adapter>> {
    let broker = RedisStreamsBroker::new(&config.queue_url, queue)
        .context("invalid queue URL")?
        .with_redeliver_after(config.redeliver_after);
    let adapter = QueueAdapter::new(broker)
        .with_publish_policy(config.publish_policy())
        .with_reconnect_policy(config.reconnect_policy());
    adapter
        .connect()
        .await
        .with_context(|| format!("cannot reach queue at {}", config.queue_url))?;
    Ok(Arc::new(adapter))
}

fn run_queue(queue_name: &str) -> String {
    let id = uuid::Uuid::now_v7().simple().to_string();
    format!("{queue_name}:run:{}", &id[id.len() - 12..])
}

/// Publishes to the queue and remembers which jobs got there.
struct Published<'a, B: Broker> {
    adapter: &'a QueueAdapter<B>,
    ids: Mutex<Vec<JobId>>,
}

impl<'a, B: Broker> Published<'a, B> {
    fn new(adapter: &'a QueueAdapter<B>) -> Self {
        Self {
            adapter,
            ids: Mutex::default(),
        }
    }

    fn into_ids(self) -> Vec<JobId> {
        self.ids.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<B: Broker> JobSink for Published<'_, B> {
    async fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        let id = job.id;
        self.adapter.dispatch(job).await?;
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        Ok(())
    }
}

fn submitter(config: &DispatchConfig) -> Result<Arc<dyn Submitter>> {
    if config.dry_run {
        info!("dry run, nothing will be submitted");
        return Ok(Arc::new(DryRunSubmitter));
    }
    let url = config
        .submit_url
        .as_deref()
        .context("no submit URL configured")?;
    let http = HttpFormSubmitter::new(url, config.submit_timeout)
        .context("building HTTP client")?;
    Ok(Arc::new(http))
}

fn processor(config: &DispatchConfig, stats: Arc<Stats>) -> Result<Arc<JobProcessor>> {
    let processor = JobProcessor::new(submitter(config)?, stats)
        .with_retry_policy(config.retry_policy())
        .with_timeout(config.submit_timeout);
    Ok(Arc::new(processor))
}

fn load_jobs(path: &Path, config: &DispatchConfig) -> Result<Vec<Job>> {
    let records = read_rows(path)?;
    let jobs: Vec<Job> = ingest_rows(records, &config.ingest_options())
        .into_iter()
        .map(|IngestedRow { job, warnings }| {
            for warning in &warnings {
                warn!(job_id = %job.id, row = job.row, %warning, "row ingested with fallback");
            }
            job
        })
        .collect();
    info!(jobs = jobs.len(), path = %path.display(), "rows loaded");
    Ok(jobs)
}

/// Logs a stats snapshot on a fixed interval.
struct Reporter {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Reporter {
    fn start(stats: Arc<Stats>, every: Option<Duration>) -> Self {
        let stop = CancellationToken::new();
        let task = every.map(|every| {
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut ticks = tokio::time::interval(every);
                ticks.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticks.tick() => log_snapshot(&stats.snapshot(), "progress"),
                    }
                }
            })
        });
        Self { stop, task }
    }

    async fn stop(self) {
        self.stop.cancel();
        if let Some(task) = self.task {
            if let Err(error) = task.await {
                warn!(%error, "reporter task failed");
            }
        }
    }
}

fn log_snapshot(snapshot: &StatsSnapshot, message: &str) {
    info!(
        processed = snapshot.processed,
        succeeded = snapshot.succeeded,
        failed = snapshot.failed,
        retried = snapshot.retried,
        in_flight = snapshot.in_flight,
        success_rate = snapshot.success_rate(),
        jobs_per_sec = snapshot.throughput(),
        elapsed_ms = snapshot.elapsed.as_millis() as u64,
        "{message}"
    );
}

fn log_report(report: &ScheduleReport) {
    info!(
        fired = report.fired,
        dropped = report.dropped,
        stale = report.stale,
        invalid_eta = report.invalid_eta,
        publish_failures = report.publish_failures,
        "schedule complete"
    );
}

/// Log the final statistics and print them to stdout.
fn finish(stats: &Stats) -> Result<()> {
    let snapshot = stats.snapshot();
    log_snapshot(&snapshot, "run finished");
    let failures = stats.recent_failures();
    if !failures.is_empty() {
        warn!(count = failures.len(), "some jobs failed");
        for failure in &failures {
            warn!(job_id = %failure.job_id, row = failure.row, reason = %failure.reason, "failed job");
        }
    }
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
