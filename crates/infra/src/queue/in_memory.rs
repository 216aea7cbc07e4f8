//! In-process broker.
//!
//! Honors the full broker contract (priority drain order, FIFO per class,
//! ack/nack, dead-lettering, redelivery when a consumer is dropped) but keeps
//! everything in memory, so it only survives as long as the process.
//!
//! With [`InMemoryBroker::with_redeliver_after`] it also hands deliveries
//! left unacked for too long to the next consumer that polls, the way the
//! Redis broker's XAUTOCLAIM does.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use dispatchq_core::Priority;

use super::{Broker, Consumer, DeliveryTag, QueueDepth, QueueError, RawDelivery};

/// A message removed from the active queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub priority: Priority,
    pub body: Vec<u8>,
    pub reason: String,
}

#[derive(Debug)]
struct Message {
    seq: u64,
    body: Vec<u8>,
}

#[derive(Debug)]
struct Unacked {
    consumer: u64,
    priority: Priority,
    message: Message,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: [VecDeque<Message>; 3],
    unacked: HashMap<u64, Unacked>,
    dead: Vec<DeadLetter>,
    next_seq: u64,
    next_consumer: u64,
    closed: bool,
    redeliver_after: Option<Duration>,
}

impl State {
    fn take_next(&mut self, consumer: u64) -> Option<RawDelivery> {
        if let Some(delivery) = self.claim_stale(consumer) {
            return Some(delivery);
        }
        for priority in Priority::ALL {
            if let Some(message) = self.ready[priority.index()].pop_front() {
                let delivery = RawDelivery {
                    tag: DeliveryTag {
                        priority,
                        id: message.seq.to_string(),
                    },
                    body: message.body.clone(),
                };
                self.unacked.insert(
                    message.seq,
                    Unacked {
                        consumer,
                        priority,
                        message,
                        delivered_at: Instant::now(),
                    },
                );
                return Some(delivery);
            }
        }
        None
    }

    /// Move the oldest expired delivery (highest priority first) to `consumer`.
    fn claim_stale(&mut self, consumer: u64) -> Option<RawDelivery> {
        let lease = self.redeliver_after?;
        let now = Instant::now();
        let seq = self
            .unacked
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.delivered_at) >= lease)
            .min_by_key(|(seq, entry)| (entry.priority.index(), **seq))
            .map(|(seq, _)| *seq)?;
        let entry = self.unacked.get_mut(&seq)?;
        debug!(delivery = seq, from = entry.consumer, to = consumer, "redelivering stale message");
        entry.consumer = consumer;
        entry.delivered_at = now;
        Some(RawDelivery {
            tag: DeliveryTag {
                priority: entry.priority,
                id: seq.to_string(),
            },
            body: entry.message.body.clone(),
        })
    }

    fn held_mut(&mut self, consumer: u64, tag: &DeliveryTag) -> Result<&mut Unacked, QueueError> {
        let seq: u64 = tag
            .id
            .parse()
            .map_err(|_| QueueError::Command(format!("invalid delivery tag {:?}", tag.id)))?;
        match self.unacked.get_mut(&seq) {
            Some(entry) if entry.consumer == consumer => Ok(entry),
            _ => Err(QueueError::Command(format!(
                "unknown delivery tag {seq} for this consumer"
            ))),
        }
    }

    fn take_unacked(&mut self, consumer: u64, tag: &DeliveryTag) -> Result<Unacked, QueueError> {
        let seq = self.held_mut(consumer, tag)?.message.seq;
        self.unacked
            .remove(&seq)
            .ok_or_else(|| QueueError::Command(format!("unknown delivery tag {seq}")))
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    available: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory broker. Cloning yields another handle to the same queues.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redeliver messages that stay unacked longer than `idle`.
    pub fn with_redeliver_after(self, idle: Duration) -> Self {
        self.shared.lock().redeliver_after = Some(idle);
        self
    }

    /// Messages dead-lettered so far, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.lock().dead.clone()
    }

    /// Shut the broker down: consumers waiting in `next` get
    /// [`QueueError::Closed`], further operations fail.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.available.notify_waiters();
    }

    fn depth_now(&self) -> QueueDepth {
        let state = self.shared.lock();
        QueueDepth {
            ready: state.ready.iter().map(|q| q.len() as u64).sum(),
            unacked: state.unacked.len() as u64,
            dead_lettered: state.dead.len() as u64,
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Consumer = InMemoryConsumer;

    async fn ping(&self) -> Result<(), QueueError> {
        if self.shared.lock().closed {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn publish(&self, priority: Priority, body: Vec<u8>) -> Result<(), QueueError> {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.ready[priority.index()].push_back(Message { seq, body });
        }
        self.shared.available.notify_one();
        Ok(())
    }

    async fn consumer(&self, name: &str) -> Result<InMemoryConsumer, QueueError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let id = state.next_consumer;
        state.next_consumer += 1;
        debug!(consumer = name, id, "in-memory consumer opened");
        Ok(InMemoryConsumer {
            shared: self.shared.clone(),
            id,
        })
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        Ok(self.depth_now())
    }

    async fn purge(&self) -> Result<u64, QueueError> {
        let mut state = self.shared.lock();
        let mut purged = 0;
        for queue in state.ready.iter_mut() {
            purged += queue.len() as u64;
            queue.clear();
        }
        Ok(purged)
    }
}

/// Consumer channel of an [`InMemoryBroker`].
///
/// Dropping it returns its unacked messages to the front of their queues,
/// like a broker does when a consumer connection goes away.
#[derive(Debug)]
pub struct InMemoryConsumer {
    shared: Arc<Shared>,
    id: u64,
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn next(&mut self, wait: Duration) -> Result<Option<RawDelivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            // Created before checking the state so a publish in between is not missed.
            let notified = self.shared.available.notified();
            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if let Some(delivery) = state.take_next(self.id) {
                    return Ok(Some(delivery));
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, tag: &DeliveryTag) -> Result<(), QueueError> {
        self.shared.lock().take_unacked(self.id, tag).map(|_| ())
    }

    fn lease(&self) -> Option<Duration> {
        self.shared.lock().redeliver_after
    }

    async fn renew(&mut self, tag: &DeliveryTag) -> Result<(), QueueError> {
        self.shared.lock().held_mut(self.id, tag)?.delivered_at = Instant::now();
        Ok(())
    }

    async fn nack(
        &mut self,
        tag: &DeliveryTag,
        requeue: bool,
        reason: &str,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.shared.lock();
            let entry = state.take_unacked(self.id, tag)?;
            if requeue {
                state.ready[entry.priority.index()].push_front(entry.message);
            } else {
                state.dead.push(DeadLetter {
                    priority: entry.priority,
                    body: entry.message.body,
                    reason: reason.to_string(),
                });
            }
        }
        if requeue {
            self.shared.available.notify_one();
        }
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        let mut orphans: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, entry)| entry.consumer == self.id)
            .map(|(seq, _)| *seq)
            .collect();
        if orphans.is_empty() {
            return;
        }
        // Newest first, so pushing to the front restores publish order.
        orphans.sort_unstable_by(|a, b| b.cmp(a));
        for seq in orphans {
            if let Some(entry) = state.unacked.remove(&seq) {
                state.ready[entry.priority.index()].push_front(entry.message);
            }
        }
        drop(state);
        self.shared.available.notify_waiters();
    }
}
