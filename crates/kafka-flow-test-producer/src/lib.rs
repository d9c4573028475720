//! Kafka producer helpers for integration testing kafka-flow.
//!
//! Provides a thin producer wrapper plus topic management so broker-backed
//! tests can create uniquely named topics, fill them with records and tear
//! nothing down (tests use throwaway topic and group names instead).

use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::debug;

/// Kafka producer wrapper for testing.
pub struct KafkaTestProducer {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaTestProducer {
    /// Create a new test producer against the given broker.
    pub fn new(broker: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", broker)
            .set("message.timeout.ms", "5000")
            .create()
            .context("Failed to create Kafka producer")?;
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", broker)
            .create()
            .context("Failed to create Kafka admin client")?;
        Ok(Self { producer, admin })
    }

    /// Create a topic with the given partition count if it does not exist.
    pub async fn create_topic_if_not_exists(&self, topic: &str, partitions: i32) -> Result<()> {
        let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(1));
        let results = self
            .admin
            .create_topics(
                &[new_topic],
                &AdminOptions::new().operation_timeout(Some(Duration::from_secs(5))),
            )
            .await
            .context("Topic creation request failed")?;
        for result in results {
            match result {
                Ok(created) => debug!("Created topic {created}"),
                Err((existing, rdkafka::types::RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Topic {existing} already exists")
                }
                Err((topic, code)) => {
                    anyhow::bail!("Failed to create topic {topic}: {code}")
                }
            }
        }
        Ok(())
    }

    /// Publish one record, returning `(partition, offset)` as stored.
    pub async fn publish(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64)> {
        let mut record = FutureRecord::to(topic).key(key).payload(payload);
        if let Some(partition) = partition {
            record = record.partition(partition);
        }
        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(error, _)| anyhow::anyhow!("Failed to publish to {topic}: {error}"))
    }

    /// Publish `count` sequentially numbered records to one partition.
    pub async fn publish_sequence(
        &self,
        topic: &str,
        partition: i32,
        count: usize,
    ) -> Result<()> {
        for index in 0..count {
            self.publish(
                topic,
                Some(partition),
                &format!("key-{index}"),
                format!("message-{index}").as_bytes(),
            )
            .await?;
        }
        Ok(())
    }
}
