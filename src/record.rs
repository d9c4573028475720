//! Record types delivered to consumers.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::commit::Committer;
use crate::error::Result;
use crate::types::{Offsets, TopicPartition};

/// Record headers as key/value pairs, in wire order.
pub type Headers = Vec<(String, Option<Bytes>)>;

/// An owned, undecoded record as returned by the client.
///
/// Raw records travel from the poll loop through the actor's per-partition
/// buffers and the prefetch queues; decoding happens at the stream edge so
/// a decode failure only affects the record it belongs to.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    /// Milliseconds since epoch, if the broker recorded one
    pub timestamp: Option<i64>,
    pub headers: Headers,
}

impl RawRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A decoded record with its commit handle.
#[derive(Debug, Clone)]
pub struct Record<K, V> {
    /// Decoded message key
    pub key: K,
    /// Decoded message value
    pub value: V,
    /// Kafka topic name
    pub topic: String,
    /// Kafka partition number
    pub partition: i32,
    /// Kafka offset within the partition
    pub offset: i64,
    /// Message timestamp in milliseconds since epoch (if available)
    pub timestamp: Option<i64>,
    /// Message headers, in wire order
    pub headers: Headers,
    committable: CommittableOffset,
}

impl<K, V> Record<K, V> {
    pub(crate) fn new(
        key: K,
        value: V,
        raw: &RawRecord,
        committable: CommittableOffset,
    ) -> Self {
        Self {
            key,
            value,
            topic: raw.topic.clone(),
            partition: raw.partition,
            offset: raw.offset,
            timestamp: raw.timestamp,
            headers: raw.headers.clone(),
            committable,
        }
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// The message timestamp as a UTC datetime, if present and representable.
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }

    /// The handle to commit this record's offset back to the group.
    pub fn committable_offset(&self) -> CommittableOffset {
        self.committable.clone()
    }
}

/// A partition/offset pair that can be committed through the consumer that
/// produced it. Carries the *next* offset, i.e. this record's offset + 1,
/// which is what the broker stores for the group.
#[derive(Clone)]
pub struct CommittableOffset {
    tp: TopicPartition,
    next_offset: i64,
    committer: Committer,
}

impl CommittableOffset {
    pub(crate) fn new(tp: TopicPartition, next_offset: i64, committer: Committer) -> Self {
        Self {
            tp,
            next_offset,
            committer,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Commit this single offset, returning once the broker acknowledged it.
    pub async fn commit(&self) -> Result<()> {
        let mut offsets = Offsets::new();
        offsets.insert(self.tp.clone(), self.next_offset);
        self.committer.commit_sync(offsets).await
    }

    /// Fold a batch of committable offsets into one commit map, keeping the
    /// highest next-offset seen per partition.
    pub fn batch(offsets: impl IntoIterator<Item = CommittableOffset>) -> Offsets {
        let mut folded = Offsets::new();
        for committable in offsets {
            let entry = folded.entry(committable.tp).or_insert(committable.next_offset);
            *entry = (*entry).max(committable.next_offset);
        }
        folded
    }
}

impl fmt::Debug for CommittableOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommittableOffset")
            .field("topic_partition", &self.tp)
            .field("next_offset", &self.next_offset)
            .finish_non_exhaustive()
    }
}
