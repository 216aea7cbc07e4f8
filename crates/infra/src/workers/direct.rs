use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, Instrument};

use dispatchq_core::Job;

use super::{JobProcessor, Outcome};
use crate::scheduler::{DispatchError, JobSink};
use crate::stats::StatsSnapshot;

/// In-process dispatch without a queue.
///
/// Jobs run through the same [`JobProcessor`] as the worker pool; retries
/// sleep the backoff inline instead of going back through a broker. At most
/// `concurrency` jobs are in progress at once.
pub struct DirectDispatcher {
    processor: Arc<JobProcessor>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

impl DirectDispatcher {
    pub fn new(processor: Arc<JobProcessor>, concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            processor,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            cancel,
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.processor.stats().snapshot()
    }

    /// Run `job` to a terminal state on the calling task and return it.
    pub async fn process(&self, job: Job) -> Job {
        run_to_completion(&self.processor, &self.cancel, job).await
    }

    /// Start `job` in the background, waiting for a free slot first.
    ///
    /// Fails with [`DispatchError::Closed`] once stopped, including while
    /// waiting for the slot.
    pub async fn submit(&self, job: Job) -> Result<(), DispatchError> {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DispatchError::Closed),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| DispatchError::Closed)?
            }
        };

        let processor = self.processor.clone();
        let cancel = self.cancel.clone();
        let span = info_span!("job", job_id = %job.id, row = job.row);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(
                async move {
                    run_to_completion(&processor, &cancel, job).await;
                    drop(permit);
                }
                .instrument(span),
            );
        Ok(())
    }

    /// Process every job with bounded concurrency and wait for all of them.
    pub async fn run_batch(&self, jobs: impl IntoIterator<Item = Job>) -> StatsSnapshot {
        for job in jobs {
            if self.submit(job).await.is_err() {
                break;
            }
        }
        self.join().await;
        self.stats()
    }

    /// Wait for every started job to reach a terminal state.
    pub async fn join(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "direct job task failed");
            }
        }
    }
}

#[async_trait]
impl JobSink for DirectDispatcher {
    async fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        self.submit(job).await
    }
}

async fn run_to_completion(processor: &JobProcessor, cancel: &CancellationToken, mut job: Job) -> Job {
    loop {
        match processor.attempt(&mut job).await {
            Outcome::Succeeded | Outcome::Failed(_) => return job,
            Outcome::Retry(backoff) => {
                let stopped = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(backoff) => false,
                };
                if stopped {
                    processor.abandon(&mut job, "shutdown before retry");
                    return job;
                }
                if let Err(e) = job.requeue() {
                    processor.abandon(&mut job, &e.to_string());
                    return job;
                }
            }
        }
    }
}
