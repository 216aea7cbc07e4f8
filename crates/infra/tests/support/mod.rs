//! Shared fixtures for the dispatch pipeline tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

use dispatchq_core::{FieldMap, Job, Priority};
use dispatchq_infra::queue::{Broker, InMemoryBroker, InMemoryConsumer, QueueDepth};
use dispatchq_infra::{DispatchError, JobSink, QueueError, SubmitError, Submitter};

pub fn job(value: &str) -> Job {
    Job::new(FieldMap::from([("entry.1".to_string(), value.to_string())]))
}

/// Submitter that plays back a script of results, then succeeds.
#[derive(Default)]
pub struct ScriptedSubmitter {
    script: Mutex<VecDeque<Result<(), SubmitError>>>,
    calls: Mutex<Vec<(Job, Instant)>>,
}

impl ScriptedSubmitter {
    pub fn new(script: impl IntoIterator<Item = Result<(), SubmitError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> Vec<(Job, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn submitted_values(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|(job, _)| job.fields["entry.1"].clone())
            .collect()
    }
}

#[async_trait]
impl Submitter for ScriptedSubmitter {
    async fn submit(&self, job: &Job) -> Result<(), SubmitError> {
        self.calls.lock().unwrap().push((job.clone(), Instant::now()));
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
pub struct AlwaysTransient {
    pub calls: AtomicU32,
}

#[async_trait]
impl Submitter for AlwaysTransient {
    async fn submit(&self, _job: &Job) -> Result<(), SubmitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SubmitError::Transient("503 Service Unavailable".into()))
    }
}

/// Fails transiently whenever `entry.1` equals the given value.
pub struct FailingOn {
    pub value: String,
    pub calls: AtomicU32,
}

impl FailingOn {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Submitter for FailingOn {
    async fn submit(&self, job: &Job) -> Result<(), SubmitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if job.fields.get("entry.1") == Some(&self.value) {
            return Err(SubmitError::Transient("connection reset by peer".into()));
        }
        Ok(())
    }
}

/// Holds every submission until the test releases it, then succeeds.
pub struct GatedSubmitter {
    entered: Notify,
    release: Semaphore,
}

impl Default for GatedSubmitter {
    fn default() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }
}

impl GatedSubmitter {
    /// Wait until a submission is in progress.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self, n: usize) {
        self.release.add_permits(n);
    }
}

#[async_trait]
impl Submitter for GatedSubmitter {
    async fn submit(&self, _job: &Job) -> Result<(), SubmitError> {
        self.entered.notify_one();
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;
        permit.forget();
        Ok(())
    }
}

/// Sink that records what the scheduler fired and when.
#[derive(Default)]
pub struct RecordingSink {
    fired: Mutex<Vec<(Job, Instant)>>,
}

impl RecordingSink {
    pub fn fired(&self) -> Vec<(Job, Instant)> {
        self.fired.lock().unwrap().clone()
    }

    pub fn rows(&self) -> Vec<Option<u64>> {
        self.fired().into_iter().map(|(job, _)| job.row).collect()
    }
}

#[async_trait]
impl JobSink for RecordingSink {
    async fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        self.fired.lock().unwrap().push((job, Instant::now()));
        Ok(())
    }
}

/// In-memory broker whose operations fail with connection errors while
/// `outages` is positive; each failed call uses one up.
#[derive(Clone, Default)]
pub struct FlakyBroker {
    inner: InMemoryBroker,
    outages: Arc<AtomicU32>,
    publish_calls: Arc<AtomicU32>,
    consumer_calls: Arc<AtomicU32>,
}

impl FlakyBroker {
    pub fn failing(outages: u32) -> Self {
        let broker = Self::default();
        broker.outages.store(outages, Ordering::SeqCst);
        broker
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryBroker {
        &self.inner
    }

    pub fn publish_calls(&self) -> u32 {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn consumer_calls(&self) -> u32 {
        self.consumer_calls.load(Ordering::SeqCst)
    }

    fn outage(&self) -> Result<(), QueueError> {
        let took = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(QueueError::Connection("connection refused".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    type Consumer = InMemoryConsumer;

    async fn ping(&self) -> Result<(), QueueError> {
        self.outage()?;
        self.inner.ping().await
    }

    async fn publish(&self, priority: Priority, body: Vec<u8>) -> Result<(), QueueError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        self.outage()?;
        self.inner.publish(priority, body).await
    }

    async fn consumer(&self, name: &str) -> Result<Self::Consumer, QueueError> {
        self.consumer_calls.fetch_add(1, Ordering::SeqCst);
        self.outage()?;
        self.inner.consumer(name).await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        self.inner.depth().await
    }

    async fn purge(&self) -> Result<u64, QueueError> {
        self.inner.purge().await
    }
}

/// Poll `check` on the paused clock until it holds, for at most `limit`.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
