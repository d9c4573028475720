//! The narrow interface the actor drives the Kafka client through.
//!
//! Only one implementation talks to a real broker ([`RdClient`], backed by
//! an `rdkafka` base consumer); the test support module provides an
//! in-memory one. Every method blocks and is only ever invoked on the
//! blocking pool through the consumer handle, which also serializes access:
//! the underlying client is not thread-safe.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer as RdkafkaConsumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers as RdkafkaHeaders, Message as RdkafkaMessage};
use rdkafka::statistics::Statistics;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::types::RDKafkaRespErr;
use rdkafka::ClientContext;
use tracing::{debug, warn};

use crate::config::ConsumerConfig;
use crate::error::Error;
use crate::record::RawRecord;
use crate::types::{Offsets, TopicPartition};

/// Assignment changes reported by the client from inside a poll call.
///
/// Callbacks run on the thread that called poll; they only push onto this
/// channel, and the actor drains it right after each poll returns, before
/// routing any polled records.
#[derive(Debug, Clone)]
pub(crate) enum ClientEvent {
    Assigned(BTreeSet<TopicPartition>),
    Revoked(BTreeSet<TopicPartition>),
}

/// Where a seek should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    Offset(i64),
    Beginning,
    End,
}

/// Blocking operations the consumer needs from a Kafka client.
///
/// Mirrors the subset of the consumer API the core uses; everything else
/// about the wire protocol stays inside the implementation.
pub trait ConsumerClient: Send + Sync + 'static {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaError>;
    fn subscribe_pattern(&self, pattern: &str) -> Result<(), KafkaError>;
    fn assign(&self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError>;
    fn unsubscribe(&self) -> Result<(), KafkaError>;

    /// Drain up to `max_records` records. The first wait is bounded by
    /// `timeout`; follow-ups must not block. Rebalance callbacks fire from
    /// inside this call.
    fn poll(&self, timeout: Duration, max_records: usize) -> Result<Vec<RawRecord>, KafkaError>;

    /// Commit the given next-offsets and wait for the broker to answer.
    fn commit(&self, offsets: &Offsets) -> Result<(), KafkaError>;

    fn pause(&self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError>;
    fn resume(&self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError>;

    fn seek(
        &self,
        tp: &TopicPartition,
        target: SeekTarget,
        timeout: Duration,
    ) -> Result<(), KafkaError>;

    /// The next offset that will be fetched for the partition, if known.
    fn position(&self, tp: &TopicPartition) -> Result<Option<i64>, KafkaError>;

    fn partitions_for(&self, topic: &str, timeout: Duration) -> Result<Vec<i32>, KafkaError>;
    fn beginning_offsets(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> Result<Offsets, KafkaError>;
    fn end_offsets(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> Result<Offsets, KafkaError>;
}

/// Client context wired into the base consumer: forwards rebalance
/// callbacks to the actor and keeps the latest statistics snapshot.
pub(crate) struct FlowContext {
    events: Sender<ClientEvent>,
    stats: Arc<Mutex<Option<Statistics>>>,
}

impl ClientContext for FlowContext {
    fn stats(&self, statistics: Statistics) {
        if let Ok(mut slot) = self.stats.lock() {
            *slot = Some(statistics);
        }
    }
}

impl ConsumerContext for FlowContext {
    // Revocations are reported pre-rebalance, before the client forgets the
    // partitions; assignments post-rebalance, once positions are in place.
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let partitions = topic_partitions(tpl);
                debug!(count = partitions.len(), "partitions revoked");
                let _ = self.events.send(ClientEvent::Revoked(partitions));
            }
            Rebalance::Error(error) => warn!(%error, "rebalance failed"),
            Rebalance::Assign(_) => {}
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let partitions = topic_partitions(tpl);
            debug!(count = partitions.len(), "partitions assigned");
            let _ = self.events.send(ClientEvent::Assigned(partitions));
        }
    }
}

fn topic_partitions(tpl: &TopicPartitionList) -> BTreeSet<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

/// The production client: an `rdkafka` base consumer owned exclusively by
/// the consumer handle.
pub struct RdClient {
    consumer: BaseConsumer<FlowContext>,
}

impl RdClient {
    /// Build the client from the consumer configuration, returning the
    /// event channel the actor drains and the statistics slot `metrics()`
    /// reads from.
    pub(crate) fn build(
        config: &ConsumerConfig,
    ) -> Result<(Self, Receiver<ClientEvent>, Arc<Mutex<Option<Statistics>>>), Error> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let stats = Arc::new(Mutex::new(None));
        let context = FlowContext {
            events: events_tx,
            stats: Arc::clone(&stats),
        };

        let mut client_config = ClientConfig::new();
        for (key, value) in &config.properties {
            client_config.set(key, value);
        }
        let consumer: BaseConsumer<FlowContext> = client_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create_with_context(context)?;

        Ok((Self { consumer }, events_rx, stats))
    }
}

impl ConsumerClient for RdClient {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaError> {
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&refs)
    }

    fn subscribe_pattern(&self, pattern: &str) -> Result<(), KafkaError> {
        // librdkafka treats topics starting with '^' as regex subscriptions.
        let pattern = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^{pattern}")
        };
        self.consumer.subscribe(&[pattern.as_str()])
    }

    fn assign(&self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError> {
        let mut tpl = TopicPartitionList::new();
        for tp in partitions {
            tpl.add_partition(&tp.topic, tp.partition);
        }
        self.consumer.assign(&tpl)
    }

    fn unsubscribe(&self) -> Result<(), KafkaError> {
        self.consumer.unsubscribe();
        Ok(())
    }

    fn poll(&self, timeout: Duration, max_records: usize) -> Result<Vec<RawRecord>, KafkaError> {
        let mut records = Vec::new();
        let mut wait = timeout;
        while records.len() < max_records {
            match self.consumer.poll(wait) {
                Some(Ok(message)) => records.push(raw_record(&message)),
                Some(Err(error)) => return Err(error),
                None => break,
            }
            // Only the first wait may block; drain the rest opportunistically.
            wait = Duration::ZERO;
        }
        Ok(records)
    }

    fn commit(&self, offsets: &Offsets) -> Result<(), KafkaError> {
        let mut tpl = TopicPartitionList::new();
        for (tp, next_offset) in offsets {
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*next_offset))?;
        }
        self.consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Sync)
    }

    fn pause(&self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError> {
        self.consumer.pause(&partition_list(partitions))
    }

    fn resume(&self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError> {
        self.consumer.resume(&partition_list(partitions))
    }

    fn seek(
        &self,
        tp: &TopicPartition,
        target: SeekTarget,
        timeout: Duration,
    ) -> Result<(), KafkaError> {
        let offset = match target {
            SeekTarget::Offset(offset) => Offset::Offset(offset),
            SeekTarget::Beginning => Offset::Beginning,
            SeekTarget::End => Offset::End,
        };
        self.consumer.seek(&tp.topic, tp.partition, offset, timeout)
    }

    fn position(&self, tp: &TopicPartition) -> Result<Option<i64>, KafkaError> {
        let positions = self.consumer.position()?;
        Ok(positions
            .find_partition(&tp.topic, tp.partition)
            .and_then(|elem| match elem.offset() {
                Offset::Offset(offset) => Some(offset),
                _ => None,
            }))
    }

    fn partitions_for(&self, topic: &str, timeout: Duration) -> Result<Vec<i32>, KafkaError> {
        let metadata = self.consumer.fetch_metadata(Some(topic), timeout)?;
        let topic_metadata = metadata
            .topics()
            .first()
            .ok_or(KafkaError::MetadataFetch(
                RDKafkaErrorCode::UnknownTopicOrPartition,
            ))?;
        check_metadata_error(topic_metadata.error())?;

        let mut partitions = Vec::with_capacity(topic_metadata.partitions().len());
        for partition_metadata in topic_metadata.partitions() {
            check_metadata_error(partition_metadata.error())?;
            partitions.push(partition_metadata.id());
        }
        Ok(partitions)
    }

    fn beginning_offsets(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> Result<Offsets, KafkaError> {
        self.watermarks(partitions, timeout, |low, _high| low)
    }

    fn end_offsets(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> Result<Offsets, KafkaError> {
        self.watermarks(partitions, timeout, |_low, high| high)
    }
}

impl RdClient {
    fn watermarks(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
        pick: impl Fn(i64, i64) -> i64,
    ) -> Result<Offsets, KafkaError> {
        let mut offsets = Offsets::new();
        for tp in partitions {
            let (low, high) = self
                .consumer
                .fetch_watermarks(&tp.topic, tp.partition, timeout)?;
            offsets.insert(tp.clone(), pick(low, high));
        }
        Ok(offsets)
    }
}

fn partition_list(partitions: &BTreeSet<TopicPartition>) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for tp in partitions {
        tpl.add_partition(&tp.topic, tp.partition);
    }
    tpl
}

fn check_metadata_error(error: Option<RDKafkaRespErr>) -> Result<(), KafkaError> {
    match error {
        Some(err) => Err(KafkaError::MetadataFetch(RDKafkaErrorCode::from(err))),
        None => Ok(()),
    }
}

fn raw_record(message: &BorrowedMessage<'_>) -> RawRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.map(Bytes::copy_from_slice),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    RawRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message.payload().map(Bytes::copy_from_slice),
        timestamp: message.timestamp().to_millis(),
        headers,
    }
}
