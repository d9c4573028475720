//! Scenario tests for the streaming consumer core.
//!
//! These run the real actor, scheduler, partition streams and commit
//! pipeline against the in-process mock cluster; no broker is needed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use kafka_flow::testing::MockCluster;
use kafka_flow::{
    CommitRecovery, ConsumerConfig, DeserializeError, Error, Offsets, StringDeserializer,
    TopicPartition,
};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("kafka_flow=debug")
        .try_init()
        .ok();
}

fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        brokers: "mock:9092".to_string(),
        group_id: "streaming-tests".to_string(),
        poll_interval: Duration::from_millis(5),
        poll_timeout: Duration::from_millis(1),
        commit_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn tp(topic: &str, partition: i32) -> TopicPartition {
    TopicPartition::new(topic, partition)
}

#[tokio::test]
async fn test_single_partition_fifo() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("fifo", 1);
    for index in 0..10 {
        cluster.produce("fifo", 0, Some(b"key".as_slice()), format!("message-{index}").as_bytes());
    }

    let consumer = cluster.consumer(fast_config(), StringDeserializer, StringDeserializer);
    consumer.subscribe(["fifo"]).await?;

    let mut records = Box::pin(consumer.stream().take(10));
    let mut offsets = Vec::new();
    while let Some(record) = timeout(WAIT, records.next()).await? {
        let record = record?;
        assert_eq!(record.topic, "fifo");
        assert_eq!(record.partition, 0);
        offsets.push(record.offset);
    }
    assert_eq!(offsets, (0..10).collect::<Vec<i64>>());

    consumer.terminate();
    consumer.await_termination().await?;
    Ok(())
}

#[tokio::test]
async fn test_backpressure_pauses_partition_and_loses_nothing() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("firehose", 1);
    let total = 40;
    for index in 0..total {
        cluster.produce("firehose", 0, None, format!("burst-{index}").as_bytes());
    }

    let config = ConsumerConfig {
        max_prefetch_batches: 2,
        max_poll_records: 5,
        ..fast_config()
    };
    let consumer = cluster.consumer(config, StringDeserializer, StringDeserializer);
    consumer.subscribe(["firehose"]).await?;

    let mut records = Box::pin(consumer.stream().take(total));
    let mut offsets = Vec::new();
    while let Some(record) = timeout(WAIT, records.next()).await? {
        offsets.push(record?.offset);
        // A deliberately slow downstream: demand dries up while the mock
        // cluster still has records, forcing the actor to buffer and pause.
        sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(offsets, (0..total as i64).collect::<Vec<i64>>());
    assert!(
        cluster.was_paused(&tp("firehose", 0)),
        "the partition should have been paused while the stream had no demand"
    );
    Ok(())
}

#[tokio::test]
async fn test_single_prefetch_batch_pauses_until_chunk_consumed() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("tight", 1);
    let total = 20;
    for index in 0..total {
        cluster.produce("tight", 0, None, format!("tight-{index}").as_bytes());
    }

    // No read-ahead at all: while a chunk sits unconsumed, no new fetch
    // reaches the actor and the partition must be paused.
    let config = ConsumerConfig {
        max_prefetch_batches: 1,
        max_poll_records: 4,
        ..fast_config()
    };
    let consumer = cluster.consumer(config, StringDeserializer, StringDeserializer);
    consumer.subscribe(["tight"]).await?;

    let mut records = Box::pin(consumer.stream().take(total));
    let first = timeout(WAIT, records.next()).await?.expect("record")?;
    assert_eq!(first.offset, 0);

    // Stall with the in-flight chunk unconsumed; polls keep running and
    // must park the partition rather than buffer without bound.
    sleep(Duration::from_millis(50)).await;
    assert!(
        cluster.was_paused(&tp("tight", 0)),
        "the partition should be paused while the in-flight chunk is unconsumed"
    );

    let mut offsets = vec![first.offset];
    while let Some(record) = timeout(WAIT, records.next()).await? {
        offsets.push(record?.offset);
    }
    assert_eq!(offsets, (0..total as i64).collect::<Vec<i64>>());
    Ok(())
}

#[tokio::test]
async fn test_revocation_terminates_partition_stream() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("shared", 2);
    for index in 0..3 {
        cluster.produce("shared", 0, None, format!("p0-{index}").as_bytes());
        cluster.produce("shared", 1, None, format!("p1-{index}").as_bytes());
    }

    let consumer = cluster.consumer(fast_config(), StringDeserializer, StringDeserializer);
    consumer.subscribe(["shared"]).await?;

    let mut maps = Box::pin(consumer.partitions_map_stream());
    let map = timeout(WAIT, maps.next()).await?.expect("initial assignment");
    assert_eq!(
        map.keys().cloned().collect::<BTreeSet<_>>(),
        BTreeSet::from([tp("shared", 0), tp("shared", 1)])
    );

    let mut streams = map.into_values();
    let mut stream_0 = Box::pin(streams.next().unwrap());
    let mut stream_1 = Box::pin(streams.next().unwrap());

    for expected in 0..3 {
        let record = timeout(WAIT, stream_1.next()).await?.expect("record")?;
        assert_eq!(record.offset, expected);
    }

    // Another consumer takes partition 1.
    cluster.revoke_partition(tp("shared", 1));
    cluster.produce("shared", 1, None, b"after-rebalance");

    // The losing stream terminates without delivering the new record...
    assert!(timeout(WAIT, stream_1.next()).await?.is_none());

    // ...while partition 0 keeps flowing.
    let record = timeout(WAIT, stream_0.next()).await?.expect("record")?;
    assert_eq!(record.offset, 0);
    assert_eq!(record.value, "p0-0");
    Ok(())
}

#[tokio::test]
async fn test_commit_and_resume_with_fresh_consumer() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("ledger", 1);
    for index in 0..5 {
        cluster.produce("ledger", 0, None, format!("entry-{index}").as_bytes());
    }

    let first = cluster.consumer(fast_config(), StringDeserializer, StringDeserializer);
    first.subscribe(["ledger"]).await?;
    let mut records = Box::pin(first.stream().take(5));
    while let Some(record) = timeout(WAIT, records.next()).await? {
        record?;
    }

    let mut offsets = Offsets::new();
    offsets.insert(tp("ledger", 0), 3);
    first.commit_sync(offsets).await?;
    assert_eq!(cluster.committed(&tp("ledger", 0)), Some(3));

    first.terminate();
    first.await_termination().await?;

    // A fresh consumer in the same group resumes from the commit.
    let second = cluster.consumer(fast_config(), StringDeserializer, StringDeserializer);
    second.subscribe(["ledger"]).await?;
    let mut resumed = Box::pin(second.stream().take(2));
    let mut seen = Vec::new();
    while let Some(record) = timeout(WAIT, resumed.next()).await? {
        seen.push(record?.offset);
    }
    assert_eq!(seen, vec![3, 4]);
    Ok(())
}

#[tokio::test]
async fn test_stop_consuming_ends_streams_but_serves_commits() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("winddown", 1);
    for index in 0..4 {
        cluster.produce("winddown", 0, None, format!("w-{index}").as_bytes());
    }

    let consumer = Arc::new(cluster.consumer(
        fast_config(),
        StringDeserializer,
        StringDeserializer,
    ));
    // Register the mirror before subscribing so the empty snapshot is the
    // first emission.
    let mut assignments = Box::pin(consumer.assignment_stream());
    consumer.subscribe(["winddown"]).await?;
    assert_eq!(
        timeout(WAIT, assignments.next()).await?.expect("snapshot"),
        BTreeSet::new()
    );
    assert_eq!(
        timeout(WAIT, assignments.next()).await?.expect("joined"),
        BTreeSet::from([tp("winddown", 0)])
    );

    let mut records = Box::pin(consumer.stream());
    let first = timeout(WAIT, records.next()).await?.expect("record")?;
    assert_eq!(first.offset, 0);

    // A commit in flight when consumption stops still completes.
    let in_flight = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move {
            consumer
                .commit_async(single_offset(tp("winddown", 0), 1))
                .await
        })
    };
    sleep(Duration::from_millis(1)).await;
    consumer.stop_consuming();
    in_flight.await??;
    assert_eq!(cluster.committed(&tp("winddown", 0)), Some(1));

    // All streams terminate within a few poll cycles.
    assert!(timeout(WAIT, async {
        while let Some(record) = records.next().await {
            record.ok();
        }
    })
    .await
    .is_ok());
    assert!(timeout(WAIT, assignments.next()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_deserialization_failure_is_inline_and_survivable() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("lossy", 1);
    cluster.produce("lossy", 0, None, b"fine-0");
    cluster.produce("lossy", 0, None, b"boom");
    cluster.produce("lossy", 0, None, b"fine-2");

    let value_deserializer =
        |_topic: &str, payload: Option<&[u8]>| -> Result<String, DeserializeError> {
            match payload {
                Some(bytes) if bytes == b"boom" => Err("corrupt payload".into()),
                Some(bytes) => Ok(String::from_utf8(bytes.to_vec())?),
                None => Ok(String::new()),
            }
        };
    let consumer = cluster.consumer(fast_config(), StringDeserializer, value_deserializer);
    consumer.subscribe(["lossy"]).await?;

    let mut records = Box::pin(consumer.stream().take(3));
    let first = timeout(WAIT, records.next()).await?.expect("first")?;
    assert_eq!(first.value, "fine-0");

    let failure = timeout(WAIT, records.next()).await?.expect("second");
    match failure {
        Err(Error::Deserialization(error)) => {
            assert_eq!(error.offset, 1);
            assert_eq!(error.target, "value");
        }
        other => panic!("expected a deserialization error, got {other:?}"),
    }

    // The stream and the consumer keep going.
    let third = timeout(WAIT, records.next()).await?.expect("third")?;
    assert_eq!(third.value, "fine-2");
    Ok(())
}

#[tokio::test]
async fn test_terminate_keeps_handed_off_records() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("cutover", 1);
    for index in 0..3 {
        cluster.produce("cutover", 0, None, format!("c-{index}").as_bytes());
    }

    let consumer = cluster.consumer(fast_config(), StringDeserializer, StringDeserializer);
    consumer.subscribe(["cutover"]).await?;
    let records = consumer.stream();

    // Let the first chunk reach the prefetch queue, then pull the plug.
    sleep(Duration::from_millis(100)).await;
    consumer.terminate();
    consumer.await_termination().await?;

    // Records already handed off are still delivered before the end.
    let delivered: Vec<i64> = Box::pin(records)
        .filter_map(|record| async move { record.ok().map(|r| r.offset) })
        .collect()
        .await;
    assert_eq!(delivered, vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn test_new_subscription_supersedes_previous_stream() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("handover", 1);
    cluster.produce("handover", 0, None, b"first");

    let consumer = cluster.consumer(fast_config(), StringDeserializer, StringDeserializer);
    consumer.subscribe(["handover"]).await?;

    let mut original = Box::pin(consumer.stream());
    let record = timeout(WAIT, original.next()).await?.expect("record")?;
    assert_eq!(record.offset, 0);

    // Re-materializing the stream surface retires the original streams.
    let mut replacement = Box::pin(consumer.stream());
    assert!(timeout(WAIT, original.next()).await?.is_none());

    cluster.produce("handover", 0, None, b"second");
    let record = timeout(WAIT, replacement.next()).await?.expect("record")?;
    assert_eq!(record.offset, 1);
    assert_eq!(record.value, "second");
    Ok(())
}

#[tokio::test]
async fn test_commit_retries_rebalance_in_progress() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("retry", 1);
    cluster.produce("retry", 0, None, b"r-0");
    cluster.fail_next_commit(rdkafka_rebalance_in_progress());

    let config = ConsumerConfig {
        commit_recovery: CommitRecovery::Default { max_attempts: 3 },
        ..fast_config()
    };
    let consumer = cluster.consumer(config, StringDeserializer, StringDeserializer);
    consumer.subscribe(["retry"]).await?;

    consumer
        .commit_sync(single_offset(tp("retry", 0), 1))
        .await?;
    assert_eq!(cluster.committed(&tp("retry", 0)), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_commit_error_surfaces_without_recovery() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("strict", 1);
    cluster.fail_next_commit(rdkafka_rebalance_in_progress());

    let config = ConsumerConfig {
        commit_recovery: CommitRecovery::None,
        ..fast_config()
    };
    let consumer = cluster.consumer(config, StringDeserializer, StringDeserializer);
    consumer.subscribe(["strict"]).await?;

    let outcome = consumer
        .commit_sync(single_offset(tp("strict", 0), 1))
        .await;
    assert!(matches!(outcome, Err(Error::Kafka(_))));
    Ok(())
}

fn rdkafka_rebalance_in_progress() -> rdkafka::error::KafkaError {
    rdkafka::error::KafkaError::ConsumerCommit(
        rdkafka::error::RDKafkaErrorCode::RebalanceInProgress,
    )
}

#[tokio::test]
async fn test_operations_after_termination_observe_shutdown() -> Result<()> {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.create_topic("gone", 1);

    let consumer = cluster.consumer(fast_config(), StringDeserializer, StringDeserializer);
    consumer.subscribe(["gone"]).await?;
    consumer.terminate();
    consumer.await_termination().await?;

    let outcome = consumer
        .commit_sync(single_offset(tp("gone", 0), 1))
        .await;
    assert!(matches!(outcome, Err(Error::Shutdown) | Err(Error::Kafka(_))));

    let subscribe_again = consumer.subscribe(["gone"]).await;
    assert!(matches!(subscribe_again, Err(Error::Shutdown)));
    Ok(())
}

fn single_offset(tp: TopicPartition, next_offset: i64) -> Offsets {
    let mut offsets = Offsets::new();
    offsets.insert(tp, next_offset);
    offsets
}
