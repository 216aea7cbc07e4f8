//! The submission job and its lifecycle.
//!
//! A job moves through an explicit state machine:
//!
//! ```text
//! Pending -> InFlight -> Succeeded
//!                     -> Retrying -> Pending   (re-published with attempt + 1)
//!                     -> Failed                (terminal, dead-lettered)
//! ```
//!
//! Every transition goes through a method on [`Job`] that rejects illegal
//! moves, so callers (and tests) can rely on the status field.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::priority::Priority;
use crate::retry::RetryPolicy;

/// Field key -> value mapping submitted for one job.
pub type FieldMap = BTreeMap<String, String>;

/// Default ceiling on attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be delivered to a worker
    Pending,
    /// Handed to the submission capability
    InFlight,
    /// Submission accepted
    Succeeded,
    /// Transient failure; will be re-published after `backoff_ms`
    Retrying { error: String, backoff_ms: u64 },
    /// Permanent failure or attempts exhausted
    Failed { reason: String },
}

impl JobStatus {
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InFlight => "in_flight",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Retrying { .. } => "retrying",
            JobStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed { .. })
    }
}

/// How a submission attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Worth retrying (network error, timeout, overloaded target)
    Transient,
    /// Retrying cannot help (rejected input)
    Permanent,
}

/// One unit of submission work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, stable across retries
    pub id: JobId,
    /// 1-based source row, when the job came from tabular input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<u64>,
    /// Values to submit
    pub fields: FieldMap,
    /// Wall-clock ETA (`YYYY-MM-DD HH:MM:SS`) in the configured timezone;
    /// `None` means immediate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    pub priority: Priority,
    /// Failed transient attempts so far (starts at 0)
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
}

impl Job {
    /// Create a new pending job for immediate dispatch at normal priority.
    pub fn new(fields: FieldMap) -> Self {
        Self {
            id: JobId::new(),
            row: None,
            fields,
            eta: None,
            priority: Priority::Normal,
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: Utc::now(),
            status: JobStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_eta(mut self, eta: impl Into<String>) -> Self {
        self.eta = Some(eta.into());
        self
    }

    pub fn with_row(mut self, row: u64) -> Self {
        self.row = Some(row);
        self
    }

    /// Set the attempt ceiling (clamped to at least one attempt).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Check the invariants a job read back from a queue must satisfy.
    pub fn validate(&self) -> DomainResult<()> {
        if self.max_attempts == 0 {
            return Err(DomainError::invariant(format!(
                "job {} has max_attempts = 0",
                self.id
            )));
        }
        if self.attempt > self.max_attempts {
            return Err(DomainError::invariant(format!(
                "job {} has attempt {} > max_attempts {}",
                self.id, self.attempt, self.max_attempts
            )));
        }
        Ok(())
    }

    /// Whether a failed attempt could still be retried.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }

    /// Pending -> InFlight.
    pub fn mark_in_flight(&mut self) -> DomainResult<()> {
        match self.status {
            JobStatus::Pending => {
                self.status = JobStatus::InFlight;
                Ok(())
            }
            ref other => Err(DomainError::illegal_transition(other.name(), "in_flight")),
        }
    }

    /// InFlight -> Succeeded.
    pub fn mark_succeeded(&mut self) -> DomainResult<()> {
        match self.status {
            JobStatus::InFlight => {
                self.status = JobStatus::Succeeded;
                Ok(())
            }
            ref other => Err(DomainError::illegal_transition(other.name(), "succeeded")),
        }
    }

    /// InFlight -> Retrying | Failed.
    ///
    /// A transient failure increments `attempt`; while `attempt < max_attempts`
    /// the job goes to `Retrying` with the policy's backoff for that attempt,
    /// otherwise it fails terminally. Permanent failures fail immediately.
    /// Only the backoff schedule is taken from `policy`; the ceiling is the
    /// job's own `max_attempts`.
    pub fn mark_failed(
        &mut self,
        kind: FailureKind,
        error: impl Into<String>,
        policy: &RetryPolicy,
    ) -> DomainResult<&JobStatus> {
        if self.status != JobStatus::InFlight {
            let to = match kind {
                FailureKind::Transient if self.has_attempts_left() => "retrying",
                _ => "failed",
            };
            return Err(DomainError::illegal_transition(self.status.name(), to));
        }

        let error = error.into();
        self.status = match kind {
            FailureKind::Permanent => JobStatus::Failed { reason: error },
            FailureKind::Transient => {
                self.attempt += 1;
                if self.attempt < self.max_attempts {
                    JobStatus::Retrying {
                        error,
                        backoff_ms: policy.delay_for_attempt(self.attempt).as_millis() as u64,
                    }
                } else {
                    JobStatus::Failed {
                        reason: format!("attempts exhausted ({}): {error}", self.attempt),
                    }
                }
            }
        };
        Ok(&self.status)
    }

    /// Retrying -> Pending, ready to be published again.
    pub fn requeue(&mut self) -> DomainResult<()> {
        match self.status {
            JobStatus::Retrying { .. } => {
                self.status = JobStatus::Pending;
                Ok(())
            }
            ref other => Err(DomainError::illegal_transition(other.name(), "pending")),
        }
    }

    /// Pending | Retrying -> Failed, without another attempt (shutdown).
    pub fn abandon(&mut self, reason: impl Into<String>) -> DomainResult<()> {
        match self.status {
            JobStatus::Pending | JobStatus::Retrying { .. } => {
                self.status = JobStatus::Failed {
                    reason: reason.into(),
                };
                Ok(())
            }
            ref other => Err(DomainError::illegal_transition(other.name(), "failed")),
        }
    }

    /// Backoff requested by the last failure, if the job is retrying.
    pub fn backoff(&self) -> Option<Duration> {
        match self.status {
            JobStatus::Retrying { backoff_ms, .. } => Some(Duration::from_millis(backoff_ms)),
            _ => None,
        }
    }

    /// Failure reason, if the job failed terminally.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> FieldMap {
        FieldMap::from([("entry.1".to_string(), "Option 1".to_string())])
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(10))
    }

    #[test]
    fn new_job_defaults() {
        let job = Job::new(fields());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.priority, Priority::Normal);
        assert!(job.eta.is_none());
        job.validate().unwrap();
    }

    #[test]
    fn success_path() {
        let mut job = Job::new(fields());
        job.mark_in_flight().unwrap();
        assert_eq!(job.status, JobStatus::InFlight);
        job.mark_succeeded().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn transient_failures_retry_until_exhausted() {
        let mut job = Job::new(fields()).with_max_attempts(3);

        job.mark_in_flight().unwrap();
        job.mark_failed(FailureKind::Transient, "timeout", &policy()).unwrap();
        assert_eq!(job.attempt, 1);
        assert_eq!(job.backoff(), Some(Duration::from_millis(100)));
        job.requeue().unwrap();

        job.mark_in_flight().unwrap();
        job.mark_failed(FailureKind::Transient, "timeout", &policy()).unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.backoff(), Some(Duration::from_millis(200)));
        job.requeue().unwrap();

        job.mark_in_flight().unwrap();
        let status = job.mark_failed(FailureKind::Transient, "timeout", &policy()).unwrap();
        assert!(matches!(status, JobStatus::Failed { .. }));
        assert_eq!(job.attempt, job.max_attempts);
        assert!(job.failure_reason().unwrap().contains("timeout"));
        job.validate().unwrap();
    }

    #[test]
    fn permanent_failure_is_terminal_immediately() {
        let mut job = Job::new(fields());
        job.mark_in_flight().unwrap();
        job.mark_failed(FailureKind::Permanent, "rejected", &policy()).unwrap();
        assert_eq!(job.failure_reason(), Some("rejected"));
        assert_eq!(job.attempt, 0);
        assert!(job.requeue().is_err());
    }

    #[test]
    fn single_attempt_jobs_never_retry() {
        let mut job = Job::new(fields()).with_max_attempts(1);
        assert!(!job.has_attempts_left());
        job.mark_in_flight().unwrap();
        job.mark_failed(FailureKind::Transient, "boom", &policy()).unwrap();
        assert!(job.status.is_terminal());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut job = Job::new(fields());
        assert_eq!(
            job.mark_succeeded().unwrap_err(),
            DomainError::illegal_transition("pending", "succeeded")
        );
        assert!(job.mark_failed(FailureKind::Transient, "x", &policy()).is_err());
        assert!(job.requeue().is_err());

        job.mark_in_flight().unwrap();
        assert!(job.mark_in_flight().is_err());
        job.mark_succeeded().unwrap();
        assert!(job.mark_in_flight().is_err());
    }

    #[test]
    fn abandon_only_applies_to_waiting_jobs() {
        let mut job = Job::new(fields());
        job.mark_in_flight().unwrap();
        assert!(job.abandon("stopping").is_err());

        job.mark_failed(FailureKind::Transient, "timeout", &policy()).unwrap();
        job.abandon("stopping").unwrap();
        assert_eq!(job.failure_reason(), Some("stopping"));
        assert!(job.abandon("again").is_err());
    }

    #[test]
    fn validate_catches_corrupt_counters() {
        let mut job = Job::new(fields());
        job.attempt = 4;
        assert!(job.validate().is_err());

        let mut job = Job::new(fields());
        job.max_attempts = 0;
        assert!(job.validate().is_err());
    }

    #[test]
    fn serde_round_trip_preserves_every_field() {
        let mut job = Job::new(fields())
            .with_priority(Priority::High)
            .with_eta("2024-08-05 10:00:00")
            .with_row(7);
        job.attempt = 1;

        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
