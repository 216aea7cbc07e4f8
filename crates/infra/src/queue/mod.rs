//! Queue Adapter: durable, priority-aware hand-off between the scheduler and
//! the worker pool.
//!
//! - [`Broker`] / [`Consumer`] abstract the broker capability set (publish,
//!   consume-with-ack, nack with requeue or dead-letter, inspection).
//! - [`InMemoryBroker`] for tests and single-process runs (not durable).
//! - `RedisStreamsBroker` (feature `redis`) for durable delivery.
//! - [`QueueAdapter`] adds job (de)serialization, bounded publish retry and
//!   reconnecting per-worker consumer sessions on top of any broker.
//!
//! Delivery is at-least-once: a message that was delivered but never acked is
//! redelivered after its consumer goes away.

mod adapter;
mod broker;
mod in_memory;
#[cfg(feature = "redis")]
mod redis_streams;

pub use adapter::{ConsumerSession, QueueAdapter, QueueMessage};
pub use broker::{Broker, Consumer, DeliveryTag, QueueDepth, RawDelivery};
pub use in_memory::{DeadLetter, InMemoryBroker, InMemoryConsumer};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConsumer};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("broker closed")]
    Closed,

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<QueueError>,
    },
}

impl QueueError {
    /// Whether reconnecting or retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }
}
