//! `dispatchq-core`: domain building blocks for scheduled job dispatch.
//!
//! This crate contains **pure domain** primitives (no IO): the job model and
//! its state machine, priorities, retry policies, ETA resolution in a fixed
//! timezone, and the row-record ingestion boundary.

pub mod error;
pub mod eta;
pub mod id;
pub mod job;
pub mod priority;
pub mod retry;
pub mod row;

pub use error::{DomainError, DomainResult};
pub use eta::{format_eta, parse_eta, parse_timezone, EtaError, DEFAULT_TIMEZONE, ETA_FORMAT};
pub use id::JobId;
pub use job::{FailureKind, FieldMap, Job, JobStatus, DEFAULT_MAX_ATTEMPTS};
pub use priority::Priority;
pub use retry::{Backoff, RetryPolicy};
pub use row::{ingest_rows, IngestOptions, IngestWarning, IngestedRow, RowRecord};

/// Timezone type used for ETAs.
pub use chrono_tz::Tz;
