//! Run-scoped statistics shared by all workers.
//!
//! All counters live behind one lock, so a [`StatsSnapshot`] is a consistent
//! point-in-time view: terminal outcomes bump `processed` together with
//! `succeeded` or `failed`, and `processed == succeeded + failed` holds in
//! every snapshot.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use dispatchq_core::JobId;

/// Failure reasons kept for reporting.
pub const FAILURE_HISTORY: usize = 1000;

/// Counter names accepted by [`Stats::incr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    Processed,
    Succeeded,
    Failed,
    Retried,
}

impl Counter {
    pub fn as_str(self) -> &'static str {
        match self {
            Counter::Processed => "processed",
            Counter::Succeeded => "succeeded",
            Counter::Failed => "failed",
            Counter::Retried => "retried",
        }
    }
}

/// A terminal failure, kept for the end-of-run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub job_id: JobId,
    pub row: Option<u64>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    succeeded: u64,
    failed: u64,
    retried: u64,
    in_flight: u64,
    failures: VecDeque<FailureRecord>,
    /// Jobs that reached a terminal outcome in this run
    finished: HashSet<JobId>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    /// Submission attempts currently running
    pub in_flight: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// Counters by name.
    pub fn counters(&self) -> BTreeMap<&'static str, u64> {
        BTreeMap::from([
            (Counter::Processed.as_str(), self.processed),
            (Counter::Succeeded.as_str(), self.succeeded),
            (Counter::Failed.as_str(), self.failed),
            (Counter::Retried.as_str(), self.retried),
        ])
    }

    /// Share of terminal outcomes that succeeded, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.succeeded as f64 * 100.0 / self.processed as f64
    }

    /// Terminal outcomes per second since the run started.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.processed as f64 / secs
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Statistics of one run. Construct one per run and share it by `Arc`.
#[derive(Debug)]
pub struct Stats {
    counters: Mutex<Counters>,
    started: Mutex<Instant>,
    changed: Notify,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Mutex::new(Instant::now()),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Counters)) {
        f(&mut self.lock());
        self.changed.notify_waiters();
    }

    /// Zero every counter and restart the clock.
    pub fn reset(&self) {
        self.update(|c| *c = Counters::default());
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Increment a single counter.
    ///
    /// Prefer the `record_*` methods for terminal outcomes; they update
    /// `processed` in the same critical section.
    pub fn incr(&self, counter: Counter) {
        self.update(|c| match counter {
            Counter::Processed => c.processed += 1,
            Counter::Succeeded => c.succeeded += 1,
            Counter::Failed => c.failed += 1,
            Counter::Retried => c.retried += 1,
        });
    }

    pub fn record_success(&self, job_id: JobId) {
        self.update(|c| {
            c.succeeded += 1;
            c.processed += 1;
            c.finished.insert(job_id);
        });
    }

    pub fn record_failure(&self, job_id: JobId, row: Option<u64>, reason: impl Into<String>) {
        let record = FailureRecord {
            job_id,
            row,
            reason: reason.into(),
            at: Utc::now(),
        };
        self.update(|c| {
            c.failed += 1;
            c.processed += 1;
            c.finished.insert(record.job_id);
            if c.failures.len() == FAILURE_HISTORY {
                c.failures.pop_front();
            }
            c.failures.push_back(record);
        });
    }

    pub fn record_retry(&self) {
        self.incr(Counter::Retried);
    }

    /// Mark a submission attempt as started; the guard ends it on drop.
    pub fn attempt(&self) -> InFlightGuard<'_> {
        self.update(|c| c.in_flight += 1);
        InFlightGuard { stats: self }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        let c = self.lock();
        StatsSnapshot {
            processed: c.processed,
            succeeded: c.succeeded,
            failed: c.failed,
            retried: c.retried,
            in_flight: c.in_flight,
            elapsed,
        }
    }

    /// Most recent terminal failures, oldest first.
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        self.lock().failures.iter().cloned().collect()
    }

    /// Wait until at least `target` jobs reached a terminal outcome.
    pub async fn wait_for_processed(&self, target: u64) {
        loop {
            let changed = self.changed.notified();
            if self.lock().processed >= target {
                return;
            }
            changed.await;
        }
    }

    /// Wait until every job in `ids` reached a terminal outcome. Outcomes of
    /// other jobs do not count.
    pub async fn wait_for_jobs(&self, ids: &[JobId]) {
        loop {
            let changed = self.changed.notified();
            {
                let c = self.lock();
                if ids.iter().all(|id| c.finished.contains(id)) {
                    return;
                }
            }
            changed.await;
        }
    }
}

/// Keeps the in-flight gauge raised while alive.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    stats: &'a Stats,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats
            .update(|c| c.in_flight = c.in_flight.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn terminal_outcomes_keep_the_identity() {
        let stats = Stats::new();
        stats.record_success(JobId::new());
        stats.record_success(JobId::new());
        stats.record_retry();
        stats.record_failure(JobId::new(), Some(3), "rejected");

        let snap = stats.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.processed, snap.succeeded + snap.failed);
        assert!((snap.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn counters_by_name() {
        let stats = Stats::new();
        stats.incr(Counter::Retried);
        stats.incr(Counter::Retried);
        let counters = stats.snapshot().counters();
        assert_eq!(counters["retried"], 2);
        assert_eq!(counters["processed"], 0);
        assert_eq!(counters.len(), 4);
    }

    #[test]
    fn in_flight_gauge_follows_guards() {
        let stats = Stats::new();
        let a = stats.attempt();
        let b = stats.attempt();
        assert_eq!(stats.snapshot().in_flight, 2);
        drop(a);
        drop(b);
        assert_eq!(stats.snapshot().in_flight, 0);
    }

    #[test]
    fn failure_history_is_bounded() {
        let stats = Stats::new();
        for i in 0..(FAILURE_HISTORY + 5) {
            stats.record_failure(JobId::new(), Some(i as u64), format!("failure {i}"));
        }
        let failures = stats.recent_failures();
        assert_eq!(failures.len(), FAILURE_HISTORY);
        assert_eq!(failures[0].reason, "failure 5");
        assert_eq!(stats.snapshot().failed, (FAILURE_HISTORY + 5) as u64);
    }

    #[test]
    fn reset_zeroes_everything() {
        let stats = Stats::new();
        stats.record_success(JobId::new());
        stats.record_failure(JobId::new(), None, "x");
        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.counters().values().sum::<u64>(), 0);
        assert!(stats.recent_failures().is_empty());
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let stats = Arc::new(Stats::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_success(JobId::new());
                        stats.record_retry();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.processed, 8000);
        assert_eq!(snap.succeeded, 8000);
        assert_eq!(snap.retried, 8000);
    }

    #[tokio::test]
    async fn wait_for_processed_wakes_on_progress() {
        let stats = Arc::new(Stats::new());
        let waiter = {
            let stats = stats.clone();
            tokio::spawn(async move { stats.wait_for_processed(2).await })
        };
        tokio::task::yield_now().await;
        stats.record_success(JobId::new());
        stats.record_failure(JobId::new(), None, "x");
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_jobs_ignores_other_jobs() {
        let stats = Arc::new(Stats::new());
        let ours = [JobId::new(), JobId::new()];
        let waiter = {
            let stats = stats.clone();
            tokio::spawn(async move { stats.wait_for_jobs(&ours).await })
        };

        stats.record_success(JobId::new());
        stats.record_failure(JobId::new(), None, "leftover from an earlier run");
        stats.record_success(ours[0]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        stats.record_failure(ours[1], Some(2), "rejected");
        waiter.await.unwrap();
        assert_eq!(stats.snapshot().processed, 4);
    }

    #[test]
    fn snapshot_serializes_elapsed_as_millis() {
        let json = serde_json::to_value(Stats::new().snapshot()).unwrap();
        assert!(json.get("elapsed_ms").is_some());
        assert_eq!(json["processed"], 0);
    }
}
