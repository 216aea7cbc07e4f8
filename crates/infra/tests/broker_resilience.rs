//! Queue adapter behaviour when the broker misbehaves.

mod support;

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use dispatchq_core::{Priority, RetryPolicy};
use dispatchq_infra::queue::{Broker, Consumer, InMemoryBroker};
use dispatchq_infra::{
    JobProcessor, QueueAdapter, QueueError, Stats, WorkerPool, WorkerPoolConfig,
};

use support::{job, FlakyBroker, ScriptedSubmitter};

fn quick(attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(attempts, Duration::from_millis(100))
}

#[tokio::test(start_paused = true)]
async fn publish_rides_out_short_outages() {
    let broker = FlakyBroker::failing(2);
    let adapter = QueueAdapter::new(broker.clone()).with_publish_policy(quick(5));

    adapter.publish(&job("a"), Priority::Normal).await.unwrap();

    assert_eq!(broker.publish_calls(), 3);
    assert_eq!(adapter.depth().await.unwrap().ready, 1);
}

#[tokio::test(start_paused = true)]
async fn publish_gives_up_after_its_budget() {
    let broker = FlakyBroker::failing(10);
    let adapter = QueueAdapter::new(broker.clone()).with_publish_policy(quick(3));

    let err = adapter.publish(&job("a"), Priority::High).await.unwrap_err();

    assert!(matches!(err, QueueError::Exhausted { attempts: 3, .. }));
    assert_eq!(broker.publish_calls(), 3);
    assert_eq!(adapter.depth().await.unwrap().ready, 0);
}

#[tokio::test(start_paused = true)]
async fn non_transient_publish_errors_are_not_retried() {
    let broker = FlakyBroker::default();
    broker.inner().close();
    let adapter = QueueAdapter::new(broker.clone()).with_publish_policy(quick(5));

    let err = adapter.publish(&job("a"), Priority::Low).await.unwrap_err();

    assert!(matches!(err, QueueError::Closed));
    assert_eq!(broker.publish_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_uses_the_reconnect_budget() {
    let adapter = QueueAdapter::new(FlakyBroker::failing(2)).with_reconnect_policy(quick(3));
    adapter.connect().await.unwrap();

    let adapter = QueueAdapter::new(FlakyBroker::failing(3)).with_reconnect_policy(quick(3));
    let err = adapter.connect().await.unwrap_err();
    assert!(matches!(err, QueueError::Exhausted { attempts: 3, .. }));
}

#[tokio::test(start_paused = true)]
async fn workers_reconnect_after_losing_the_broker() {
    let broker = FlakyBroker::default();
    let adapter = Arc::new(
        QueueAdapter::new(broker.clone())
            .with_reconnect_policy(quick(5))
            .with_poll_interval(Duration::from_millis(50)),
    );
    adapter.publish(&job("survivor"), Priority::Normal).await.unwrap();
    broker.fail_next(2);

    let submitter = Arc::new(ScriptedSubmitter::default());
    let stats = Arc::new(Stats::new());
    let processor = Arc::new(JobProcessor::new(submitter.clone(), stats.clone()));
    let pool = WorkerPool::new(
        adapter.clone(),
        processor,
        WorkerPoolConfig::default().with_workers(1),
    )
    .spawn(CancellationToken::new());

    stats.wait_for_processed(1).await;
    pool.shutdown().await;

    assert_eq!(broker.consumer_calls(), 3);
    assert_eq!(submitter.submitted_values(), ["survivor"]);
}

#[tokio::test(start_paused = true)]
async fn undecodable_messages_are_dead_lettered_and_skipped() {
    let broker = InMemoryBroker::new();
    broker.publish(Priority::High, b"{not a job".to_vec()).await.unwrap();
    let adapter = Arc::new(QueueAdapter::new(broker.clone()));
    adapter.publish(&job("fine"), Priority::Normal).await.unwrap();

    let submitter = Arc::new(ScriptedSubmitter::default());
    let stats = Arc::new(Stats::new());
    let processor = Arc::new(JobProcessor::new(submitter.clone(), stats.clone()));
    let pool = WorkerPool::new(adapter.clone(), processor, WorkerPoolConfig::default())
        .spawn(CancellationToken::new());

    stats.wait_for_processed(1).await;
    pool.shutdown().await;

    assert_eq!(submitter.submitted_values(), ["fine"]);
    let dead = broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.starts_with("undecodable job"));
}

#[tokio::test(start_paused = true)]
async fn pool_stops_when_the_broker_closes() {
    let broker = InMemoryBroker::new();
    let adapter = Arc::new(QueueAdapter::new(broker.clone()));
    let processor = Arc::new(JobProcessor::new(
        Arc::new(ScriptedSubmitter::default()),
        Arc::new(Stats::new()),
    ));
    let pool = WorkerPool::new(adapter, processor, WorkerPoolConfig::default())
        .spawn(CancellationToken::new());

    tokio::time::sleep(Duration::from_secs(2)).await;
    broker.close();
    pool.join().await;
}

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::High), Just(Priority::Normal), Just(Priority::Low)]
}

proptest! {
    #[test]
    fn in_memory_broker_orders_by_priority_then_fifo(
        priorities in proptest::collection::vec(priority(), 0..40)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let delivered = runtime.block_on(async {
            let broker = InMemoryBroker::new();
            for (i, p) in priorities.iter().enumerate() {
                broker.publish(*p, i.to_string().into_bytes()).await.unwrap();
            }
            let mut consumer = broker.consumer("prop").await.unwrap();
            let mut delivered = Vec::new();
            while let Some(raw) = consumer.next(Duration::ZERO).await.unwrap() {
                let index: usize = String::from_utf8(raw.body).unwrap().parse().unwrap();
                consumer.ack(&raw.tag).await.unwrap();
                delivered.push(index);
            }
            delivered
        });

        let mut expected: Vec<usize> = (0..priorities.len()).collect();
        expected.sort_by_key(|&i| priorities[i].index());
        prop_assert_eq!(delivered, expected);
    }
}
