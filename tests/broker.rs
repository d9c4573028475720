//! End-to-end tests against a real Kafka broker.
//!
//! These are `#[ignore]`d because they need a broker at localhost:9092
//! (e.g. `docker run -p 9092:9092 apache/kafka`). Run them with
//! `cargo test --test broker -- --ignored`.

use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use kafka_flow::{Consumer, ConsumerConfig, Offsets, StringDeserializer, TopicPartition};
use kafka_flow_test_producer::KafkaTestProducer;
use tokio::time::timeout;
use uuid::Uuid;

const BROKER: &str = "localhost:9092";
const WAIT: Duration = Duration::from_secs(30);

fn broker_config(group_id: &str) -> ConsumerConfig {
    ConsumerConfig {
        brokers: BROKER.to_string(),
        group_id: group_id.to_string(),
        ..Default::default()
    }
}

fn unique(name: &str) -> String {
    format!("{name}-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore]
async fn test_broker_fifo_consume_commit_resume() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("kafka_flow=debug")
        .try_init()
        .ok();

    let topic = unique("flow-e2e");
    let group = unique("flow-group");
    let producer = KafkaTestProducer::new(BROKER)?;
    producer.create_topic_if_not_exists(&topic, 1).await?;
    producer.publish_sequence(&topic, 0, 5).await?;

    // Consume everything in order.
    let consumer: Consumer<String, String> =
        Consumer::new(broker_config(&group), StringDeserializer, StringDeserializer)?;
    consumer.subscribe([topic.as_str()]).await?;

    let mut records = Box::pin(consumer.stream().take(5));
    let mut offsets = Vec::new();
    while let Some(record) = timeout(WAIT, records.next()).await? {
        let record = record?;
        assert_eq!(record.value, format!("message-{}", record.offset));
        offsets.push(record.offset);
    }
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);

    // Commit a mid-stream position and terminate.
    let tp = TopicPartition::new(topic.clone(), 0);
    let mut committed = Offsets::new();
    committed.insert(tp.clone(), 3);
    consumer.commit_sync(committed).await?;
    consumer.terminate();
    consumer.await_termination().await?;

    // A fresh consumer in the same group resumes at the committed offset.
    let resumed: Consumer<String, String> =
        Consumer::new(broker_config(&group), StringDeserializer, StringDeserializer)?;
    resumed.subscribe([topic.as_str()]).await?;
    let mut records = Box::pin(resumed.stream().take(2));
    let mut seen = Vec::new();
    while let Some(record) = timeout(WAIT, records.next()).await? {
        seen.push(record?.offset);
    }
    assert_eq!(seen, vec![3, 4]);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_broker_seek_and_position() -> Result<()> {
    let topic = unique("flow-seek");
    let group = unique("flow-group");
    let producer = KafkaTestProducer::new(BROKER)?;
    producer.create_topic_if_not_exists(&topic, 1).await?;
    producer.publish_sequence(&topic, 0, 10).await?;

    let consumer: Consumer<String, String> =
        Consumer::new(broker_config(&group), StringDeserializer, StringDeserializer)?;
    let tp = TopicPartition::new(topic.clone(), 0);
    consumer.assign([tp.clone()]).await?;

    // Watermarks reflect the produced records.
    let beginnings = consumer.beginning_offsets([tp.clone()]).await?;
    assert_eq!(beginnings.get(&tp), Some(&0));
    let ends = consumer.end_offsets([tp.clone()]).await?;
    assert_eq!(ends.get(&tp), Some(&10));

    // Seek sticks until the next record is consumed.
    consumer.seek(tp.clone(), 7).await?;
    assert_eq!(consumer.position(tp.clone()).await?, Some(7));

    let mut records = Box::pin(consumer.stream().take(3));
    let mut seen = Vec::new();
    while let Some(record) = timeout(WAIT, records.next()).await? {
        seen.push(record?.offset);
    }
    assert_eq!(seen, vec![7, 8, 9]);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_broker_two_consumers_split_partitions() -> Result<()> {
    let topic = unique("flow-split");
    let group = unique("flow-group");
    let producer = KafkaTestProducer::new(BROKER)?;
    producer.create_topic_if_not_exists(&topic, 2).await?;

    let first: Consumer<String, String> =
        Consumer::new(broker_config(&group), StringDeserializer, StringDeserializer)?;
    first.subscribe([topic.as_str()]).await?;

    // Wait until the lone consumer owns both partitions.
    let mut assignments = Box::pin(first.assignment_stream());
    loop {
        let assignment = timeout(WAIT, assignments.next()).await?.expect("assignment");
        if assignment.len() == 2 {
            break;
        }
    }

    // A second group member triggers a rebalance that splits the topic.
    let second: Consumer<String, String> =
        Consumer::new(broker_config(&group), StringDeserializer, StringDeserializer)?;
    second.subscribe([topic.as_str()]).await?;

    let first_assignment = timeout(WAIT, async {
        loop {
            let assignment = assignments.next().await.expect("assignment update");
            if assignment.len() == 1 {
                return assignment;
            }
        }
    })
    .await?;
    let second_assignment = timeout(WAIT, async {
        loop {
            let assignment = second.assignment().await.expect("assignment query");
            if assignment.len() == 1 {
                return assignment;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await?;

    // Between them the two consumers hold exactly the topic's partitions.
    let union: Vec<_> = first_assignment
        .union(&second_assignment)
        .cloned()
        .collect();
    assert_eq!(union.len(), 2);
    assert!(first_assignment.is_disjoint(&second_assignment));
    Ok(())
}
