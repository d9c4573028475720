//! Partition-aware streaming consumer for Apache Kafka.
//!
//! `kafka-flow` wraps a single (not thread-safe) Kafka client in an actor
//! and fans it out into per-partition record streams with bounded prefetch.
//!
//! # Features
//!
//! - Partition Streams: one backpressured stream per assigned partition,
//!   created and torn down in lock-step with group rebalances
//! - Exactly-once hand-off: records are delivered to user code once per
//!   subscription, in offset order within each partition
//! - Flow Control: partitions are paused on the client while their stream
//!   has no demand, so a slow consumer never buffers unboundedly
//! - Manual Offsets: commits are explicit, batched through the actor, and
//!   complete only after the broker acknowledged them
//! - Pluggable Decoding: keys and values pass through a [`Deserializer`];
//!   decode failures surface inline without stopping the stream
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use kafka_flow::{Consumer, ConsumerConfig, StringDeserializer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kafka_flow::Error> {
//!     let config = ConsumerConfig {
//!         brokers: "localhost:9092".to_string(),
//!         group_id: "example".to_string(),
//!         ..Default::default()
//!     };
//!     let consumer = Consumer::new(config, StringDeserializer, StringDeserializer)?;
//!     consumer.subscribe(["events"]).await?;
//!
//!     let mut records = Box::pin(consumer.stream().take(10));
//!     while let Some(record) = records.next().await {
//!         let record = record?;
//!         println!("{}@{}: {}", record.topic_partition(), record.offset, record.value);
//!         record.committable_offset().commit().await?;
//!     }
//!     Ok(())
//! }
//! ```

mod actor;
mod commit;
mod handle;
mod lifecycle;
mod partition_stream;
mod request;
mod scheduler;
mod streams;

/// The blocking client interface the actor drives, and its rdkafka-backed
/// implementation.
pub mod client;
pub mod config;
pub mod consumer;
pub mod deserializer;
pub mod error;
pub mod record;

/// In-process test support: a scripted cluster behind the client interface.
pub mod testing;
pub mod types;

pub use client::{ConsumerClient, RdClient, SeekTarget};
pub use config::{CommitRecovery, ConsumerConfig};
pub use consumer::Consumer;
pub use deserializer::{
    BytesDeserializer, DeserializeError, Deserializer, JsonDeserializer, StringDeserializer,
};
pub use error::{DeserializationError, Error, Result};
pub use partition_stream::PartitionStream;
pub use record::{CommittableOffset, Headers, RawRecord, Record};
pub use types::{Offsets, TopicPartition};
