//! Core identifiers shared across the consumer.

use std::collections::BTreeMap;
use std::fmt;

/// One log within a Kafka topic.
///
/// Ordered by topic name first, then by partition index, so that iteration
/// over partition maps is stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition index within the topic
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Offsets to commit, keyed by partition. Values are *next* offsets: the
/// offset the consumer group should resume from, i.e. consumed offset + 1.
pub type Offsets = BTreeMap<TopicPartition, i64>;

/// Identifies one subscription to the top-level stream surface.
///
/// Fetches tagged with a stream id that is no longer the active one are
/// answered with a revocation, which is how partition streams belonging to
/// an abandoned subscription wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) u64);

/// Identifies one incarnation of a per-partition stream.
///
/// A revocation followed by a re-assignment of the same partition produces
/// a fresh incarnation id, so replies meant for the dead incarnation can be
/// told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionStreamId(pub(crate) u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_ordering() {
        let mut tps = vec![
            TopicPartition::new("b", 0),
            TopicPartition::new("a", 10),
            TopicPartition::new("a", 2),
            TopicPartition::new("b", 1),
        ];
        tps.sort();
        assert_eq!(
            tps,
            vec![
                TopicPartition::new("a", 2),
                TopicPartition::new("a", 10),
                TopicPartition::new("b", 0),
                TopicPartition::new("b", 1),
            ]
        );
    }

    #[test]
    fn test_topic_partition_display() {
        assert_eq!(TopicPartition::new("events", 3).to_string(), "events-3");
    }
}
