use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use dispatchq_core::Job;

use super::{JobProcessor, Outcome};
use crate::queue::{Broker, ConsumerSession, QueueAdapter, QueueMessage};
use crate::stats::{Stats, StatsSnapshot};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Prefix of worker (and consumer) names
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            name: "worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Fixed set of workers draining a queue.
///
/// Each worker owns one consumer session, takes one message at a time,
/// submits it and acks or nacks it before taking the next.
pub struct WorkerPool<B: Broker> {
    adapter: Arc<QueueAdapter<B>>,
    processor: Arc<JobProcessor>,
    config: WorkerPoolConfig,
}

impl<B: Broker> WorkerPool<B> {
    pub fn new(
        adapter: Arc<QueueAdapter<B>>,
        processor: Arc<JobProcessor>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            adapter,
            processor,
            config,
        }
    }

    /// Start the workers. They run until `cancel` fires (or the broker is
    /// closed); see [`PoolHandle::shutdown`].
    pub fn spawn(self, cancel: CancellationToken) -> PoolHandle {
        let stats = self.processor.stats().clone();
        let mut tasks = JoinSet::new();

        for i in 1..=self.config.workers.max(1) {
            let name = format!("{}-{i}", self.config.name);
            let worker = Worker {
                session: self.adapter.session(name.clone()),
                adapter: self.adapter.clone(),
                processor: self.processor.clone(),
                cancel: cancel.clone(),
            };
            let span = info_span!("worker", name = %name);
            tasks.spawn(worker.run().instrument(span));
        }
        info!(workers = tasks.len(), "worker pool started");

        PoolHandle {
            cancel,
            tasks,
            stats,
        }
    }
}

/// Handle to control and join a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    stats: Arc<Stats>,
}

impl PoolHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop taking new messages and wait until every in-flight job has been
    /// acked or nacked.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Wait for all workers to exit without signalling them.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "worker task failed");
            }
        }
        info!("worker pool stopped");
    }
}

struct Worker<B: Broker> {
    session: ConsumerSession<B>,
    adapter: Arc<QueueAdapter<B>>,
    processor: Arc<JobProcessor>,
    cancel: CancellationToken,
}

impl<B: Broker> Worker<B> {
    async fn run(mut self) {
        debug!("worker started");
        loop {
            let message = match self.session.consume(&self.cancel).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "consumer stopped");
                    break;
                }
            };

            let span = info_span!("job", job_id = %message.job.id, row = message.job.row, attempt = message.job.attempt);
            self.handle(message).instrument(span).await;
        }
        debug!("worker stopped");
    }

    /// Process one delivery to a terminal ack/nack.
    async fn handle(&mut self, message: QueueMessage) {
        let mut job = message.job.clone();

        match self.processor.attempt(&mut job).await {
            Outcome::Succeeded => self.ack(&message).await,
            Outcome::Failed(reason) => self.dead_letter(&message, &reason).await,
            Outcome::Retry(backoff) => {
                if self.hold(&message, backoff).await {
                    self.retry(&message, job).await;
                }
            }
        }
    }

    /// Wait out `backoff` while keeping `message` leased, so the broker does
    /// not hand it to another consumer meanwhile. Shutdown cuts the wait
    /// short. Returns false once the delivery is no longer ours.
    async fn hold(&mut self, message: &QueueMessage, backoff: Duration) -> bool {
        let until = Instant::now() + backoff;
        let step = self
            .session
            .lease()
            .map(|lease| lease / 2)
            .filter(|step| !step.is_zero());

        loop {
            if step.is_some() && !self.renew(message).await {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            let wake = step.map_or(until, |step| (now + step).min(until));
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                _ = sleep_until(wake) => {}
            }
        }
    }

    async fn renew(&mut self, message: &QueueMessage) -> bool {
        match self.session.renew(message).await {
            Ok(()) => true,
            Err(e) => {
                // Another consumer (or a redelivery) owns it now.
                warn!(error = %e, "delivery lost during backoff, leaving it to the broker");
                false
            }
        }
    }

    /// Publish the next attempt, then ack the delivery it replaces.
    async fn retry(&mut self, message: &QueueMessage, mut job: Job) {
        if let Err(e) = job.requeue() {
            error!(error = %e, "cannot requeue job");
            return self.dead_letter(message, &e.to_string()).await;
        }
        match self.adapter.publish(&job, job.priority).await {
            Ok(()) => self.ack(message).await,
            Err(e) => {
                // The original delivery goes back instead, with its old attempt count.
                warn!(error = %e, "re-publish failed, requeueing original delivery");
                if let Err(e) = self.session.nack(message, true, "retry").await {
                    warn!(error = %e, "nack failed; broker will redeliver");
                }
            }
        }
    }

    async fn ack(&mut self, message: &QueueMessage) {
        if let Err(e) = self.session.ack(message).await {
            // At-least-once: the job may be delivered and submitted again.
            warn!(error = %e, "ack failed; broker will redeliver");
        }
    }

    async fn dead_letter(&mut self, message: &QueueMessage, reason: &str) {
        if let Err(e) = self.session.nack(message, false, reason).await {
            warn!(error = %e, "dead-letter failed; broker will redeliver");
        }
    }
}
