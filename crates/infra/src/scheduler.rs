//! ETA Scheduler.
//!
//! Holds jobs until their ETA and hands each one to a [`JobSink`] exactly
//! once. A single loop sleeps until the soonest pending entry, re-arming
//! whenever an entry is added, instead of polling.
//!
//! Ordering: entries fire by (fire time, load order), so jobs with the same
//! ETA keep their input order. Jobs without ETA, with an unparseable ETA or
//! an ETA in the past fire immediately.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use dispatchq_core::{parse_eta, Job};

use crate::queue::{Broker, QueueAdapter, QueueError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("dispatcher is shut down")]
    Closed,
}

/// Where fired jobs go: the queue, or the direct dispatcher.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn dispatch(&self, job: Job) -> Result<(), DispatchError>;
}

#[async_trait]
impl<B: Broker> JobSink for QueueAdapter<B> {
    async fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        self.publish(&job, job.priority).await?;
        Ok(())
    }
}

#[async_trait]
impl<S: JobSink + ?Sized> JobSink for Arc<S> {
    async fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        (**self).dispatch(job).await
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Zone ETAs are written in
    pub timezone: Tz,
    /// ETAs older than this are reported as stale (they still fire)
    pub stale_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Jakarta,
            stale_after: Duration::from_secs(3600),
        }
    }
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    /// Entries handed to the sink successfully
    pub fired: u64,
    /// Pending entries discarded by the stop signal
    pub dropped: u64,
    /// Entries whose ETA was older than the staleness threshold
    pub stale: u64,
    /// Entries whose ETA could not be parsed (fired immediately)
    pub invalid_eta: u64,
    /// Entries the sink refused
    pub publish_failures: u64,
}

/// A job paired with its absolute fire time.
#[derive(Debug)]
pub struct ScheduleEntry {
    pub job: Job,
    pub fire_at: DateTime<Utc>,
    seq: u64,
}

impl PartialEq for ScheduleEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduleEntry {}

impl PartialOrd for ScheduleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduleEntry {
    /// Reversed, so the max-heap pops the earliest entry first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Adds jobs to a running scheduler and stops it.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Job>,
    stop: CancellationToken,
}

impl SchedulerHandle {
    /// Schedule another job. Returns it back if the scheduler has ended.
    pub fn add(&self, job: Job) -> Result<(), Job> {
        self.tx.send(job).map_err(|e| e.0)
    }

    /// Drop every entry that has not fired yet and end the run.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

pub struct EtaScheduler {
    config: SchedulerConfig,
    heap: BinaryHeap<ScheduleEntry>,
    next_seq: u64,
    report: ScheduleReport,
    /// Monotonic and wall-clock time sampled together; fire times are
    /// converted to timer deadlines relative to this pair.
    anchor: (Instant, DateTime<Utc>),
    tx: Option<mpsc::UnboundedSender<Job>>,
    rx: mpsc::UnboundedReceiver<Job>,
    stop: CancellationToken,
}

impl EtaScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_stop(config, CancellationToken::new())
    }

    /// Create a scheduler that also stops when `stop` (e.g. a process-wide
    /// shutdown token) is cancelled.
    pub fn with_stop(config: SchedulerConfig, stop: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            heap: BinaryHeap::new(),
            next_seq: 0,
            report: ScheduleReport::default(),
            anchor: (Instant::now(), Utc::now()),
            tx: Some(tx),
            rx,
            stop,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.tx.clone().unwrap_or_else(|| mpsc::unbounded_channel().0),
            stop: self.stop.clone(),
        }
    }

    /// Number of entries waiting to fire.
    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    /// Schedule jobs in input order.
    pub fn load(&mut self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            self.push(job);
        }
    }

    fn push(&mut self, job: Job) {
        let now = self.now();
        let fire_at = self.resolve(&job, now);
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(job_id = %job.id, row = job.row, %fire_at, "job scheduled");
        self.heap.push(ScheduleEntry { job, fire_at, seq });
    }

    /// Fire time of a job: its ETA, or `now` when absent, invalid or past.
    fn resolve(&mut self, job: &Job, now: DateTime<Utc>) -> DateTime<Utc> {
        let Some(raw) = job.eta.as_deref() else {
            return now;
        };
        match parse_eta(raw, self.config.timezone) {
            Ok(at) if at > now => at,
            Ok(at) => {
                let late = (now - at).to_std().unwrap_or_default();
                if late > self.config.stale_after {
                    self.report.stale += 1;
                    warn!(job_id = %job.id, row = job.row, eta = raw, late_secs = late.as_secs(), "stale ETA, dispatching now");
                } else {
                    debug!(job_id = %job.id, eta = raw, "ETA already passed, dispatching now");
                }
                now
            }
            Err(e) => {
                self.report.invalid_eta += 1;
                warn!(job_id = %job.id, row = job.row, error = %e, "invalid ETA, dispatching now");
                now
            }
        }
    }

    /// Wall-clock "now" on the scheduler's own clock.
    fn now(&self) -> DateTime<Utc> {
        let (instant, wall) = self.anchor;
        let since = Instant::now().saturating_duration_since(instant);
        wall + chrono::Duration::from_std(since).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn deadline(&self, fire_at: DateTime<Utc>) -> Instant {
        let (instant, wall) = self.anchor;
        instant + (fire_at - wall).to_std().unwrap_or_default()
    }

    /// Fire entries as they come due until every entry fired and all handles
    /// are gone, or until stopped.
    pub async fn run<S: JobSink + ?Sized>(mut self, sink: &S) -> ScheduleReport {
        let span = info_span!("scheduler", pending = self.heap.len());
        async move {
            // Only handles keep the intake open from here on.
            self.tx = None;
            let mut intake_open = true;

            loop {
                self.fire_due(sink).await;

                if self.stop.is_cancelled() {
                    break;
                }
                if self.heap.is_empty() && !intake_open {
                    break;
                }

                let next = self.heap.peek().map(|entry| self.deadline(entry.fire_at));
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => break,
                    added = self.rx.recv(), if intake_open => match added {
                        Some(job) => self.push(job),
                        None => intake_open = false,
                    },
                    _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {}
                }
            }

            // Jobs still in the intake count as pending too.
            self.rx.close();
            let mut queued = 0;
            while self.rx.try_recv().is_ok() {
                queued += 1;
            }
            self.report.dropped = self.heap.len() as u64 + queued;
            if self.report.dropped > 0 {
                warn!(dropped = self.report.dropped, "scheduler stopped, pending entries dropped");
            }
            info!(
                fired = self.report.fired,
                dropped = self.report.dropped,
                stale = self.report.stale,
                invalid_eta = self.report.invalid_eta,
                publish_failures = self.report.publish_failures,
                "scheduler finished"
            );
            self.report
        }
        .instrument(span)
        .await
    }

    async fn fire_due<S: JobSink + ?Sized>(&mut self, sink: &S) {
        loop {
            if self.stop.is_cancelled() {
                return;
            }
            let due = match self.heap.peek() {
                Some(entry) => self.deadline(entry.fire_at) <= Instant::now(),
                None => false,
            };
            if !due {
                return;
            }
            let Some(entry) = self.heap.pop() else {
                return;
            };

            let job_id = entry.job.id;
            let row = entry.job.row;
            // A dispatch that has started always completes, even if stop
            // arrives meanwhile.
            match sink.dispatch(entry.job).await {
                Ok(()) => {
                    self.report.fired += 1;
                    info!(%job_id, row, fire_at = %entry.fire_at, "job dispatched");
                }
                Err(e) => {
                    self.report.publish_failures += 1;
                    error!(%job_id, row, error = %e, "failed to dispatch job");
                }
            }
        }
    }
}
