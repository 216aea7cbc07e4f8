use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use dispatchq_core::Priority;

use super::QueueError;

/// Broker-assigned handle identifying one delivery.
///
/// Only meaningful to the consumer that received it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub priority: Priority,
    pub id: String,
}

/// A message as handed out by a broker, before decoding.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
}

/// Message counts of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Waiting to be delivered
    pub ready: u64,
    /// Delivered, not yet acked or nacked
    pub unacked: u64,
    pub dead_lettered: u64,
}

/// A durable, priority-capable message broker.
///
/// Implementations must deliver `High` before `Normal` before `Low` whenever
/// several are ready, and FIFO within one priority.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Consumer: Consumer;

    /// Check that the broker is reachable.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Persist one message.
    async fn publish(&self, priority: Priority, body: Vec<u8>) -> Result<(), QueueError>;

    /// Open a consumer channel. Each worker opens its own; a consumer is
    /// never shared between tasks.
    async fn consumer(&self, name: &str) -> Result<Self::Consumer, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// Remove all ready messages. Returns how many were removed.
    async fn purge(&self) -> Result<u64, QueueError>;
}

/// One consumer channel.
#[async_trait]
pub trait Consumer: Send + 'static {
    /// Wait up to `wait` for the next message.
    async fn next(&mut self, wait: Duration) -> Result<Option<RawDelivery>, QueueError>;

    /// Remove a delivered message permanently.
    async fn ack(&mut self, tag: &DeliveryTag) -> Result<(), QueueError>;

    /// Return a delivered message to its queue (`requeue`) or dead-letter it
    /// with `reason`.
    async fn nack(&mut self, tag: &DeliveryTag, requeue: bool, reason: &str)
    -> Result<(), QueueError>;

    /// How long a delivery may sit unacked before the broker hands it to
    /// another consumer. `None` when only a lost consumer triggers
    /// redelivery.
    fn lease(&self) -> Option<Duration> {
        None
    }

    /// Reset the idle time of a delivery this consumer still holds.
    async fn renew(&mut self, _tag: &DeliveryTag) -> Result<(), QueueError> {
        Ok(())
    }
}
