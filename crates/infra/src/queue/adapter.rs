use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dispatchq_core::{Job, Priority, RetryPolicy};

use super::{Broker, Consumer, DeliveryTag, QueueDepth, QueueError};

/// How long one `Consumer::next` call may block before the session re-checks
/// for cancellation.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A decoded job plus the delivery tag needed to ack or nack it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub job: Job,
    tag: DeliveryTag,
}

impl QueueMessage {
    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }
}

/// Job-level client of a [`Broker`].
///
/// Publishing retries transient failures with bounded backoff; consuming goes
/// through per-worker [`ConsumerSession`]s that reconnect on their own.
#[derive(Debug)]
pub struct QueueAdapter<B: Broker> {
    broker: Arc<B>,
    publish_policy: RetryPolicy,
    reconnect_policy: RetryPolicy,
    poll_interval: Duration,
}

impl<B: Broker> QueueAdapter<B> {
    pub fn new(broker: B) -> Self {
        Self {
            broker: Arc::new(broker),
            publish_policy: RetryPolicy::exponential(
                5,
                Duration::from_millis(200),
                Duration::from_secs(5),
            ),
            reconnect_policy: RetryPolicy::exponential(
                5,
                Duration::from_millis(500),
                Duration::from_secs(30),
            ),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_publish_policy(mut self, policy: RetryPolicy) -> Self {
        self.publish_policy = policy;
        self
    }

    /// Backoff for reconnects. `max_attempts` is the startup budget used by
    /// [`QueueAdapter::connect`]; running sessions keep retrying with the
    /// same backoff until cancelled.
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Verify the broker is reachable within the reconnect budget.
    ///
    /// Failing here is a fatal startup error.
    pub async fn connect(&self) -> Result<(), QueueError> {
        retry_transient(&self.reconnect_policy, "connect", || self.broker.ping()).await?;
        info!("queue broker reachable");
        Ok(())
    }

    /// Persist `job` on the `priority` channel.
    pub async fn publish(&self, job: &Job, priority: Priority) -> Result<(), QueueError> {
        let body =
            serde_json::to_vec(job).map_err(|e| QueueError::Serialization(e.to_string()))?;

        retry_transient(&self.publish_policy, "publish", || {
            self.broker.publish(priority, body.clone())
        })
        .await?;

        debug!(job_id = %job.id, row = job.row, %priority, attempt = job.attempt, "job published");
        Ok(())
    }

    /// Open a consumer session for one worker. The broker channel is opened
    /// lazily on the first `consume`.
    pub fn session(&self, name: impl Into<String>) -> ConsumerSession<B> {
        ConsumerSession {
            broker: self.broker.clone(),
            name: name.into(),
            consumer: None,
            reconnect_policy: self.reconnect_policy.clone(),
            poll_interval: self.poll_interval,
        }
    }

    pub async fn depth(&self) -> Result<QueueDepth, QueueError> {
        self.broker.depth().await
    }

    pub async fn purge(&self) -> Result<u64, QueueError> {
        let purged = self.broker.purge().await?;
        info!(purged, "queue purged");
        Ok(purged)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or
/// `policy.max_attempts` is used up.
async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    what: &'static str,
    mut op: F,
) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                error!(operation = what, attempts = attempt, error = %e, "giving up");
                return Err(QueueError::Exhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = what,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "broker operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// One worker's exclusive consumer channel.
///
/// Owned by a single task. Connection failures drop the channel and reopen
/// it with exponential backoff; messages delivered on the lost channel are
/// redelivered by the broker.
pub struct ConsumerSession<B: Broker> {
    broker: Arc<B>,
    name: String,
    consumer: Option<B::Consumer>,
    reconnect_policy: RetryPolicy,
    poll_interval: Duration,
}

impl<B: Broker> ConsumerSession<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next valid job.
    ///
    /// Returns `Ok(None)` once `cancel` fires. Messages that do not decode
    /// into a valid job are dead-lettered and skipped.
    pub async fn consume(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let mut failures = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            if self.consumer.is_none() {
                match self.broker.consumer(&self.name).await {
                    Ok(consumer) => {
                        if failures > 0 {
                            info!(consumer = %self.name, failures, "consumer reconnected");
                        }
                        failures = 0;
                        self.consumer = Some(consumer);
                    }
                    Err(QueueError::Closed) => return Err(QueueError::Closed),
                    Err(e) => {
                        failures += 1;
                        warn!(consumer = %self.name, failures, error = %e, "cannot open consumer");
                        self.backoff(failures, cancel).await;
                        continue;
                    }
                }
            }
            let Some(consumer) = self.consumer.as_mut() else {
                continue;
            };

            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                next = consumer.next(self.poll_interval) => next,
            };

            match next {
                Ok(None) => {}
                Ok(Some(raw)) => match decode(&raw.body) {
                    Ok(job) => return Ok(Some(QueueMessage { job, tag: raw.tag })),
                    Err(reason) => {
                        warn!(consumer = %self.name, delivery = %raw.tag.id, %reason, "undecodable message, dead-lettering");
                        let reason = format!("undecodable job: {reason}");
                        if let Err(e) = consumer.nack(&raw.tag, false, &reason).await {
                            self.drop_channel(e)?;
                        }
                    }
                },
                Err(e) => {
                    self.drop_channel(e)?;
                    failures += 1;
                    self.backoff(failures, cancel).await;
                }
            }
        }
    }

    /// Acknowledge a message: it will never be delivered again.
    pub async fn ack(&mut self, message: &QueueMessage) -> Result<(), QueueError> {
        let consumer = self.consumer.as_mut().ok_or(QueueError::Closed)?;
        let result = consumer.ack(&message.tag).await;
        self.after(result)
    }

    /// Requeue (`requeue = true`) or dead-letter a message.
    pub async fn nack(
        &mut self,
        message: &QueueMessage,
        requeue: bool,
        reason: &str,
    ) -> Result<(), QueueError> {
        let consumer = self.consumer.as_mut().ok_or(QueueError::Closed)?;
        let result = consumer.nack(&message.tag, requeue, reason).await;
        self.after(result)
    }

    /// Idle time after which the broker gives a held delivery to someone
    /// else; see [`Consumer::lease`].
    pub fn lease(&self) -> Option<Duration> {
        self.consumer.as_ref().and_then(|consumer| consumer.lease())
    }

    /// Keep holding `message`: reset its idle time on the broker.
    pub async fn renew(&mut self, message: &QueueMessage) -> Result<(), QueueError> {
        let consumer = self.consumer.as_mut().ok_or(QueueError::Closed)?;
        let result = consumer.renew(&message.tag).await;
        self.after(result)
    }

    fn after(&mut self, result: Result<(), QueueError>) -> Result<(), QueueError> {
        if let Err(e) = &result {
            if e.is_transient() {
                // The broker redelivers everything this channel held.
                self.consumer = None;
            }
        }
        result
    }

    /// Drop the channel after a failure; `Closed` is final and surfaced.
    fn drop_channel(&mut self, e: QueueError) -> Result<(), QueueError> {
        if matches!(e, QueueError::Closed) {
            return Err(e);
        }
        warn!(consumer = %self.name, error = %e, "consumer channel failed, reconnecting");
        self.consumer = None;
        Ok(())
    }

    /// Sleep before reconnect attempt `failures + 1`, cut short by `cancel`.
    async fn backoff(&mut self, failures: u32, cancel: &CancellationToken) {
        let delay = self.reconnect_policy.delay_for_attempt(failures);
        debug!(consumer = %self.name, retry_in_ms = delay.as_millis() as u64, "waiting to reconnect");
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn decode(body: &[u8]) -> Result<Job, String> {
    let job: Job = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    job.validate().map_err(|e| e.to_string())?;
    Ok(job)
}
