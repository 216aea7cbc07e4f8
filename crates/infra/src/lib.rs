//! Infrastructure layer: queue brokers, scheduling, workers, submission.
//!
//! Everything here is constructed explicitly and passed by reference; there
//! is no process-wide state. One run owns one [`stats::Stats`], one
//! [`queue::QueueAdapter`] and the workers it spawns.

pub mod config;
pub mod queue;
pub mod scheduler;
pub mod stats;
pub mod submit;
pub mod workers;

pub use config::{ConfigError, DispatchConfig};
pub use queue::{Broker, Consumer, QueueAdapter, QueueDepth, QueueError, QueueMessage};
pub use scheduler::{DispatchError, EtaScheduler, JobSink, ScheduleReport, SchedulerConfig};
pub use stats::{Counter, Stats, StatsSnapshot};
pub use submit::{DryRunSubmitter, SubmitError, Submitter};
pub use workers::{DirectDispatcher, JobProcessor, Outcome, PoolHandle, WorkerPool, WorkerPoolConfig};
