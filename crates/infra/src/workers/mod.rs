//! Worker Pool and direct (no-queue) dispatch.
//!
//! Both paths run jobs through the same [`JobProcessor`], so they produce
//! the same state transitions and the same statistics.

mod direct;
mod pool;

pub use direct::DirectDispatcher;
pub use pool::{PoolHandle, WorkerPool, WorkerPoolConfig};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use dispatchq_core::{FailureKind, Job, JobStatus, RetryPolicy};

use crate::stats::Stats;
use crate::submit::{SubmitError, Submitter};

/// What should happen to a job after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Try again after the backoff; the job is in `Retrying`
    Retry(Duration),
    /// Terminal failure; the job is in `Failed`
    Failed(String),
}

/// Runs one submission attempt and applies the retry policy.
///
/// Statistics are updated here, once per attempt outcome: `retried` for each
/// scheduled retry, `processed` plus `succeeded`/`failed` for terminal ones.
pub struct JobProcessor {
    submitter: Arc<dyn Submitter>,
    retry: RetryPolicy,
    timeout: Duration,
    stats: Arc<Stats>,
}

impl JobProcessor {
    pub fn new(submitter: Arc<dyn Submitter>, stats: Arc<Stats>) -> Self {
        Self {
            submitter,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            stats,
        }
    }

    /// Backoff schedule between attempts. The attempt ceiling is each job's
    /// own `max_attempts`.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-attempt limit on the submission call; hitting it is a transient
    /// failure.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Submit `job` once. The job must be `Pending`.
    pub async fn attempt(&self, job: &mut Job) -> Outcome {
        if let Err(e) = job.mark_in_flight() {
            let reason = format!("job not runnable: {e}");
            warn!(job_id = %job.id, status = job.status.name(), "{reason}");
            self.stats.record_failure(job.id, job.row, reason.clone());
            return Outcome::Failed(reason);
        }

        let result = {
            let _in_flight = self.stats.attempt();
            match tokio::time::timeout(self.timeout, self.submitter.submit(job)).await {
                Ok(result) => result,
                Err(_) => Err(SubmitError::Timeout(self.timeout)),
            }
        };

        let error = match result {
            Ok(()) => {
                // InFlight -> Succeeded cannot fail here.
                let _ = job.mark_succeeded();
                self.stats.record_success(job.id);
                info!(job_id = %job.id, row = job.row, attempt = job.attempt + 1, "job succeeded");
                return Outcome::Succeeded;
            }
            Err(e) => e,
        };

        let kind = error.kind();
        let outcome = match job.mark_failed(kind, error.to_string(), &self.retry) {
            Ok(JobStatus::Retrying { backoff_ms, .. }) => {
                Outcome::Retry(Duration::from_millis(*backoff_ms))
            }
            Ok(JobStatus::Failed { reason }) => Outcome::Failed(reason.clone()),
            Ok(other) => Outcome::Failed(format!("unexpected status {}", other.name())),
            Err(e) => Outcome::Failed(e.to_string()),
        };

        match &outcome {
            Outcome::Retry(backoff) => {
                self.stats.record_retry();
                warn!(
                    job_id = %job.id,
                    row = job.row,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "attempt failed, will retry"
                );
            }
            Outcome::Failed(reason) => {
                self.stats.record_failure(job.id, job.row, reason.clone());
                warn!(
                    job_id = %job.id,
                    row = job.row,
                    attempt = job.attempt,
                    permanent = kind == FailureKind::Permanent,
                    %reason,
                    "job failed"
                );
            }
            Outcome::Succeeded => {}
        }
        outcome
    }

    /// Give up on a job that is waiting for a retry (shutdown). Counts as a
    /// terminal failure.
    pub fn abandon(&self, job: &mut Job, reason: &str) {
        match job.abandon(reason) {
            Ok(()) => {
                self.stats.record_failure(job.id, job.row, reason);
                info!(job_id = %job.id, row = job.row, %reason, "job abandoned");
            }
            Err(e) => debug!(job_id = %job.id, error = %e, "nothing to abandon"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dispatchq_core::FieldMap;
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<Result<(), SubmitError>>>);

    #[async_trait]
    impl Submitter for Scripted {
        async fn submit(&self, _job: &Job) -> Result<(), SubmitError> {
            self.0.lock().unwrap().remove(0)
        }
    }

    struct Hanging;

    #[async_trait]
    impl Submitter for Hanging {
        async fn submit(&self, _job: &Job) -> Result<(), SubmitError> {
            std::future::pending().await
        }
    }

    fn processor(submitter: impl Submitter) -> JobProcessor {
        JobProcessor::new(Arc::new(submitter), Arc::new(Stats::new())).with_retry_policy(
            RetryPolicy::exponential(3, Duration::from_millis(10), Duration::from_secs(1)),
        )
    }

    fn job() -> Job {
        Job::new(FieldMap::from([("entry.1".into(), "x".into())]))
    }

    #[tokio::test]
    async fn success_is_terminal() {
        let p = processor(Scripted(Mutex::new(vec![Ok(())])));
        let mut job = job();
        assert_eq!(p.attempt(&mut job).await, Outcome::Succeeded);
        assert_eq!(job.status, JobStatus::Succeeded);
        let snap = p.stats().snapshot();
        assert_eq!((snap.processed, snap.succeeded), (1, 1));
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry() {
        let p = processor(Scripted(Mutex::new(vec![Err(SubmitError::Transient("503".into()))])));
        let mut job = job();
        assert_eq!(p.attempt(&mut job).await, Outcome::Retry(Duration::from_millis(10)));
        assert_eq!(job.attempt, 1);
        let snap = p.stats().snapshot();
        assert_eq!((snap.processed, snap.retried), (0, 1));
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal() {
        let p = processor(Scripted(Mutex::new(vec![Err(SubmitError::Permanent("400".into()))])));
        let mut job = job();
        assert!(matches!(p.attempt(&mut job).await, Outcome::Failed(_)));
        assert_eq!(p.stats().recent_failures().len(), 1);
        assert_eq!(p.stats().snapshot().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_feed_the_retry_path() {
        let p = processor(Hanging).with_timeout(Duration::from_secs(5));
        let mut job = job();
        assert!(matches!(p.attempt(&mut job).await, Outcome::Retry(_)));
        assert_eq!(p.stats().snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn non_pending_jobs_are_rejected() {
        let p = processor(Scripted(Mutex::new(vec![])));
        let mut job = job();
        job.mark_in_flight().unwrap();
        assert!(matches!(p.attempt(&mut job).await, Outcome::Failed(_)));
    }
}
