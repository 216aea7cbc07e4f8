//! The external submission capability.
//!
//! A [`Submitter`] performs one submission of a job's fields and classifies
//! failures as transient (worth retrying) or permanent.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpFormSubmitter;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use dispatchq_core::{FailureKind, Job};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("transient submission failure: {0}")]
    Transient(String),

    #[error("submission rejected: {0}")]
    Permanent(String),

    #[error("submission timed out after {0:?}")]
    Timeout(Duration),
}

impl SubmitError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SubmitError::Transient(_) | SubmitError::Timeout(_) => FailureKind::Transient,
            SubmitError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

/// Submits one job. Must tolerate being called more than once for the same
/// job id: delivery is at-least-once.
#[async_trait]
pub trait Submitter: Send + Sync + 'static {
    async fn submit(&self, job: &Job) -> Result<(), SubmitError>;
}

/// Logs the fields and reports success without contacting anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunSubmitter;

#[async_trait]
impl Submitter for DryRunSubmitter {
    async fn submit(&self, job: &Job) -> Result<(), SubmitError> {
        info!(
            job_id = %job.id,
            row = job.row,
            fields = ?job.fields,
            "dry run: submission skipped"
        );
        Ok(())
    }
}
