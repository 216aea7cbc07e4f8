//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Streams**: one per priority class, `{queue}:high`, `{queue}:normal`,
//!   `{queue}:low`. Consumers read them in that order, so higher classes
//!   drain first; within a stream entries are FIFO.
//! - **Consumer group**: shared by all workers of all processes; each worker
//!   is a named consumer inside it.
//! - **Redelivery**: entries left unacknowledged for longer than
//!   `redeliver_after` (consumer crashed or lost its connection) are claimed
//!   by the next consumer that polls (XAUTOCLAIM). A worker that keeps an
//!   entry through a retry backoff renews it (XCLAIM, zero idle) so it stays
//!   with that worker.
//! - **Dead-letter queue**: `{queue}:dlq`, one entry per dead-lettered job
//!   with its reason.
//!
//! Acked entries are deleted from their stream, so `XLEN - pending` is the
//! number of ready messages. A requeued message is appended again and goes to
//! the back of its class.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use dispatchq_core::Priority;

use super::{Broker, Consumer, DeliveryTag, QueueDepth, QueueError, RawDelivery};

const DEFAULT_GROUP: &str = "dispatchq-workers";

/// Idle time after which an unacknowledged entry is redelivered.
const DEFAULT_REDELIVER_AFTER: Duration = Duration::from_secs(600);

const PURGE_BATCH: usize = 100;

#[derive(Clone)]
pub struct RedisStreamsBroker {
    client: Arc<Client>,
    queue: String,
    group: String,
    /// Distinguishes consumers of different processes using the same names
    instance: String,
    redeliver_after: Duration,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("queue", &self.queue)
            .field("group", &self.group)
            .field("instance", &self.instance)
            .field("redeliver_after", &self.redeliver_after)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsBroker {
    /// Create a broker for `queue` (e.g. `dispatchq:jobs`).
    ///
    /// No connection is made until the first operation.
    pub fn new(redis_url: impl AsRef<str>, queue: impl Into<String>) -> Result<Self, QueueError> {
        let client = Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let instance = uuid::Uuid::now_v7().simple().to_string();

        Ok(Self {
            client: Arc::new(client),
            queue: queue.into(),
            group: DEFAULT_GROUP.to_string(),
            instance: instance[instance.len() - 8..].to_string(),
            redeliver_after: DEFAULT_REDELIVER_AFTER,
            conn: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_redeliver_after(mut self, idle: Duration) -> Self {
        self.redeliver_after = idle;
        self
    }

    fn keys(&self) -> StreamKeys {
        StreamKeys::new(&self.queue)
    }

    /// Shared connection for producer-side commands.
    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        ensure_groups(&mut conn, &self.keys(), &self.group).await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the shared connection after a connection-level failure.
    async fn checked<T>(&self, result: Result<T, QueueError>) -> Result<T, QueueError> {
        if let Err(e) = &result {
            if e.is_transient() {
                *self.conn.lock().await = None;
            }
        }
        result
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    type Consumer = RedisStreamsConsumer;

    async fn ping(&self) -> Result<(), QueueError> {
        let result = async {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            Ok::<_, QueueError>(())
        }
        .await;
        self.checked(result).await
    }

    #[instrument(skip(self, body), fields(queue = %self.queue), err)]
    async fn publish(&self, priority: Priority, body: Vec<u8>) -> Result<(), QueueError> {
        let result = async {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("XADD")
                .arg(self.keys().stream(priority))
                .arg("*")
                .arg("payload")
                .arg(body)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("XADD", e))?;
            Ok::<_, QueueError>(())
        }
        .await;
        self.checked(result).await
    }

    async fn consumer(&self, name: &str) -> Result<RedisStreamsConsumer, QueueError> {
        // Blocking reads must not stall other users of a connection, so every
        // consumer gets its own.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        let keys = self.keys();
        ensure_groups(&mut conn, &keys, &self.group).await?;

        let name = format!("{name}-{}", self.instance);
        debug!(consumer = %name, group = %self.group, "redis consumer opened");
        Ok(RedisStreamsConsumer {
            conn,
            keys,
            group: self.group.clone(),
            name,
            redeliver_after: self.redeliver_after,
        })
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let result = async {
            let mut conn = self.connection().await?;
            let keys = self.keys();
            let mut depth = QueueDepth::default();
            for priority in Priority::ALL {
                let key = keys.stream(priority);
                let len: u64 = redis::cmd("XLEN")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| command_error("XLEN", e))?;
                let summary: Value = redis::cmd("XPENDING")
                    .arg(&key)
                    .arg(&self.group)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| command_error("XPENDING", e))?;
                let pending = pending_count(&summary);
                depth.ready += len.saturating_sub(pending);
                depth.unacked += pending;
            }
            depth.dead_lettered = redis::cmd("XLEN")
                .arg(&keys.dlq)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("XLEN", e))?;
            Ok::<_, QueueError>(depth)
        }
        .await;
        self.checked(result).await
    }

    async fn purge(&self) -> Result<u64, QueueError> {
        let result = async {
            let mut conn = self.connection().await?;
            let keys = self.keys();
            let purger = format!("purge-{}", self.instance);
            let mut purged = 0;

            for priority in Priority::ALL {
                let key = keys.stream(priority);
                // Claiming through the group skips entries other consumers hold.
                loop {
                    let reply: Value = redis::cmd("XREADGROUP")
                        .arg("GROUP")
                        .arg(&self.group)
                        .arg(&purger)
                        .arg("COUNT")
                        .arg(PURGE_BATCH)
                        .arg("STREAMS")
                        .arg(&key)
                        .arg(">")
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| command_error("XREADGROUP", e))?;
                    let ids: Vec<String> = parse_read_reply(reply)?
                        .into_iter()
                        .map(|entry| entry.id)
                        .collect();
                    if ids.is_empty() {
                        break;
                    }
                    redis::pipe()
                        .atomic()
                        .cmd("XACK")
                        .arg(&key)
                        .arg(&self.group)
                        .arg(&ids)
                        .ignore()
                        .cmd("XDEL")
                        .arg(&key)
                        .arg(&ids)
                        .ignore()
                        .query_async::<_, ()>(&mut conn)
                        .await
                        .map_err(|e| command_error("XACK/XDEL", e))?;
                    purged += ids.len() as u64;
                }

                let _: Value = redis::cmd("XGROUP")
                    .arg("DELCONSUMER")
                    .arg(&key)
                    .arg(&self.group)
                    .arg(&purger)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| command_error("XGROUP DELCONSUMER", e))?;
            }
            Ok::<_, QueueError>(purged)
        }
        .await;
        self.checked(result).await
    }
}

/// One worker's consumer inside the group, on its own connection.
pub struct RedisStreamsConsumer {
    conn: MultiplexedConnection,
    keys: StreamKeys,
    group: String,
    name: String,
    redeliver_after: Duration,
}

impl RedisStreamsConsumer {
    /// Take over one entry another consumer left unacknowledged too long.
    async fn claim_stale(&mut self, priority: Priority) -> Result<Option<RawDelivery>, QueueError> {
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(self.keys.stream(priority))
            .arg(&self.group)
            .arg(&self.name)
            .arg(self.redeliver_after.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| command_error("XAUTOCLAIM", e))?;

        let entries = match reply {
            Value::Bulk(parts) => match parts.into_iter().nth(1) {
                Some(Value::Bulk(entries)) => entries,
                _ => return Ok(None),
            },
            _ => return Ok(None),
        };
        for entry in entries {
            // Entries deleted while pending come back as nil.
            if let Some(entry) = parse_entry(entry)? {
                warn!(consumer = %self.name, delivery = %entry.id, %priority, "redelivering stale message");
                return Ok(Some(entry.into_delivery(priority)));
            }
        }
        Ok(None)
    }

    async fn read_new(&mut self, priority: Priority) -> Result<Option<RawDelivery>, QueueError> {
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.name)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(self.keys.stream(priority))
            .arg(">")
            .query_async(&mut self.conn)
            .await
            .map_err(|e| command_error("XREADGROUP", e))?;

        Ok(parse_read_reply(reply)?
            .into_iter()
            .next()
            .map(|entry| entry.into_delivery(priority)))
    }

    /// Block until any stream receives a new entry or `wait` elapses.
    ///
    /// Reads outside the group, so nothing is claimed; the caller re-runs
    /// the priority-ordered pass afterwards.
    async fn wait_for_new(&mut self, wait: Duration) -> Result<(), QueueError> {
        let block_ms = (wait.as_millis() as u64).max(1);
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(1).arg("BLOCK").arg(block_ms).arg("STREAMS");
        for priority in Priority::ALL {
            cmd.arg(self.keys.stream(priority));
        }
        for _ in Priority::ALL {
            cmd.arg("$");
        }
        let _: Value = cmd
            .query_async(&mut self.conn)
            .await
            .map_err(|e| command_error("XREAD", e))?;
        Ok(())
    }

    async fn payload(&mut self, key: &str, id: &str) -> Result<Option<Vec<u8>>, QueueError> {
        let reply: Value = redis::cmd("XRANGE")
            .arg(key)
            .arg(id)
            .arg(id)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| command_error("XRANGE", e))?;
        match reply {
            Value::Bulk(entries) => match entries.into_iter().next() {
                Some(entry) => Ok(parse_entry(entry)?.map(|e| e.payload)),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Consumer for RedisStreamsConsumer {
    async fn next(&mut self, wait: Duration) -> Result<Option<RawDelivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            for priority in Priority::ALL {
                if let Some(delivery) = self.claim_stale(priority).await? {
                    return Ok(Some(delivery));
                }
            }
            for priority in Priority::ALL {
                if let Some(delivery) = self.read_new(priority).await? {
                    return Ok(Some(delivery));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.wait_for_new(remaining).await?;
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, tag: &DeliveryTag) -> Result<(), QueueError> {
        let key = self.keys.stream(tag.priority);
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&key)
            .arg(&self.group)
            .arg(&tag.id)
            .ignore()
            .cmd("XDEL")
            .arg(&key)
            .arg(&tag.id)
            .ignore()
            .query_async::<_, ()>(&mut self.conn)
            .await
            .map_err(|e| command_error("XACK", e))
    }

    async fn nack(
        &mut self,
        tag: &DeliveryTag,
        requeue: bool,
        reason: &str,
    ) -> Result<(), QueueError> {
        let key = self.keys.stream(tag.priority);
        let Some(payload) = self.payload(&key, &tag.id).await? else {
            warn!(delivery = %tag.id, "nacked entry no longer exists, acking");
            return self.ack(tag).await;
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        if requeue {
            pipe.cmd("XADD").arg(&key).arg("*").arg("payload").arg(payload).ignore();
        } else {
            pipe.cmd("XADD")
                .arg(&self.keys.dlq)
                .arg("*")
                .arg("original_id")
                .arg(&tag.id)
                .arg("priority")
                .arg(tag.priority.as_str())
                .arg("reason")
                .arg(reason)
                .arg("failed_at")
                .arg(chrono::Utc::now().to_rfc3339())
                .arg("payload")
                .arg(payload)
                .ignore();
        }
        pipe.cmd("XACK")
            .arg(&key)
            .arg(&self.group)
            .arg(&tag.id)
            .ignore()
            .cmd("XDEL")
            .arg(&key)
            .arg(&tag.id)
            .ignore();

        pipe.query_async::<_, ()>(&mut self.conn)
            .await
            .map_err(|e| command_error("nack", e))?;

        if !requeue {
            warn!(delivery = %tag.id, priority = %tag.priority, %reason, "message sent to dead-letter queue");
        }
        Ok(())
    }

    fn lease(&self) -> Option<Duration> {
        Some(self.redeliver_after)
    }

    /// XCLAIM with no minimum idle time resets the entry's idle clock, so
    /// XAUTOCLAIM elsewhere leaves it alone.
    async fn renew(&mut self, tag: &DeliveryTag) -> Result<(), QueueError> {
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(self.keys.stream(tag.priority))
            .arg(&self.group)
            .arg(&self.name)
            .arg(0)
            .arg(&tag.id)
            .arg("JUSTID")
            .query_async(&mut self.conn)
            .await
            .map_err(|e| command_error("XCLAIM", e))?;
        if claimed.is_empty() {
            return Err(QueueError::Command(format!(
                "delivery {} is no longer pending",
                tag.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StreamKeys {
    base: String,
    dlq: String,
}

impl StreamKeys {
    fn new(queue: &str) -> Self {
        Self {
            base: queue.to_string(),
            dlq: format!("{queue}:dlq"),
        }
    }

    fn stream(&self, priority: Priority) -> String {
        format!("{}:{}", self.base, priority.as_str())
    }
}

/// Create the consumer group on every priority stream (idempotent).
async fn ensure_groups(
    conn: &mut MultiplexedConnection,
    keys: &StreamKeys,
    group: &str,
) -> Result<(), QueueError> {
    for priority in Priority::ALL {
        // MKSTREAM creates the stream; "0" makes existing entries visible to
        // the group.
        let created: Result<String, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(keys.stream(priority))
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;
        match created {
            Ok(_) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(command_error("XGROUP CREATE", e)),
        }
    }
    Ok(())
}

fn map_redis_error(e: RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        QueueError::Connection(e.to_string())
    } else {
        QueueError::Command(e.to_string())
    }
}

fn command_error(command: &str, e: RedisError) -> QueueError {
    match map_redis_error(e) {
        QueueError::Command(msg) => QueueError::Command(format!("{command} failed: {msg}")),
        other => other,
    }
}

#[derive(Debug, PartialEq)]
struct StreamEntry {
    id: String,
    payload: Vec<u8>,
}

impl StreamEntry {
    fn into_delivery(self, priority: Priority) -> RawDelivery {
        RawDelivery {
            tag: DeliveryTag {
                priority,
                id: self.id,
            },
            body: self.payload,
        }
    }
}

/// Parse `[id, [field, value, ...]]`. Nil entries yield `None`; a missing
/// payload yields an empty body, which consumers reject as undecodable.
fn parse_entry(entry: Value) -> Result<Option<StreamEntry>, QueueError> {
    let parts = match entry {
        Value::Nil => return Ok(None),
        Value::Bulk(parts) => parts,
        _ => {
            return Err(QueueError::Deserialization(
                "invalid stream entry format".to_string(),
            ));
        }
    };

    let mut parts = parts.into_iter();
    let id = match parts.next() {
        Some(Value::Data(data)) => String::from_utf8_lossy(&data).into_owned(),
        Some(Value::Status(id)) => id,
        _ => {
            return Err(QueueError::Deserialization(
                "invalid message ID format".to_string(),
            ));
        }
    };

    let fields = match parts.next() {
        Some(Value::Bulk(fields)) => fields,
        // Deleted while pending.
        Some(Value::Nil) => return Ok(None),
        _ => {
            return Err(QueueError::Deserialization(
                "invalid fields format".to_string(),
            ));
        }
    };

    let mut payload = Vec::new();
    for chunk in fields.chunks(2) {
        if let [Value::Data(key), Value::Data(value)] = chunk {
            if key.as_slice() == b"payload" {
                payload = value.clone();
            }
        }
    }
    Ok(Some(StreamEntry { id, payload }))
}

/// Parse an XREADGROUP reply: `[[stream, [entry, ...]], ...]` or nil.
fn parse_read_reply(reply: Value) -> Result<Vec<StreamEntry>, QueueError> {
    let streams = match reply {
        Value::Nil => return Ok(Vec::new()),
        Value::Bulk(streams) => streams,
        _ => {
            return Err(QueueError::Deserialization(
                "invalid XREADGROUP reply".to_string(),
            ));
        }
    };

    let mut out = Vec::new();
    for stream in streams {
        let Value::Bulk(pair) = stream else { continue };
        let Some(Value::Bulk(entries)) = pair.into_iter().nth(1) else {
            continue;
        };
        for entry in entries {
            if let Some(entry) = parse_entry(entry)? {
                out.push(entry);
            }
        }
    }
    Ok(out)
}

/// First element of an `XPENDING key group` summary.
fn pending_count(summary: &Value) -> u64 {
    match summary {
        Value::Bulk(parts) => match parts.first() {
            Some(Value::Int(n)) => (*n).max(0) as u64,
            _ => 0,
        },
        _ => 0,
    }
}
