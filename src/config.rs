use std::collections::HashMap;
use std::time::Duration;

use crate::error::Error;

/// Configuration for the streaming consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    /// Consumer group ID
    pub group_id: String,
    /// Auto offset reset strategy ("earliest" or "latest")
    ///
    /// "earliest" means the consumer will start from the beginning of the
    /// topic if no committed offsets are found for the consumer group.
    /// "latest" means the consumer will start from the end of the topic.
    pub auto_offset_reset: String,
    /// How often the scheduler injects a poll when no user request is pending.
    ///
    /// Polls drive record delivery, group heartbeats and rebalance
    /// callbacks, so this bounds how stale an idle consumer can get.
    pub poll_interval: Duration,
    /// How long a single client poll may block waiting for the first record.
    pub poll_timeout: Duration,
    /// Upper bound on records drained from the client per poll cycle.
    pub max_poll_records: usize,
    /// Number of record chunks a partition stream may hold ahead of its
    /// consumer. The prefetch queue holds `max_prefetch_batches - 1` chunks
    /// plus the one in flight; when it fills up, the partition is paused on
    /// the client until the consumer catches up. A value of 1 disables
    /// read-ahead entirely: a new chunk is only requested once the previous
    /// one was consumed. Must be at least 1.
    pub max_prefetch_batches: usize,
    /// Deadline for a single commit to be acknowledged by the broker.
    pub commit_timeout: Duration,
    /// What to do when the broker rejects a commit with a transient error.
    pub commit_recovery: CommitRecovery,
    /// Additional properties passed through to the underlying client.
    ///
    /// `enable.auto.commit` and `enable.partition.eof` are always pinned to
    /// `false` by the library and cannot be overridden here.
    pub properties: HashMap<String, String>,
}

/// Recovery policy for commits rejected with a transient broker error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitRecovery {
    /// Retry commits rejected with a rebalance-in-progress error, re-driving
    /// them on subsequent poll cycles up to the given number of attempts.
    Default { max_attempts: u32 },
    /// Surface every commit error to the caller immediately.
    None,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "kafka-flow".to_string(),
            auto_offset_reset: "earliest".to_string(),
            poll_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(50),
            max_poll_records: 500,
            max_prefetch_batches: 2,
            commit_timeout: Duration::from_secs(15),
            commit_recovery: CommitRecovery::Default { max_attempts: 10 },
            properties: HashMap::new(),
        }
    }
}

impl ConsumerConfig {
    /// Check the configuration for values the consumer cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.brokers.is_empty() {
            return Err(Error::InvalidConfig("brokers must not be empty".into()));
        }
        if self.group_id.is_empty() {
            return Err(Error::InvalidConfig("group_id must not be empty".into()));
        }
        if self.max_prefetch_batches == 0 {
            return Err(Error::InvalidConfig(
                "max_prefetch_batches must be at least 1".into(),
            ));
        }
        if self.max_poll_records == 0 {
            return Err(Error::InvalidConfig(
                "max_poll_records must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Capacity of the per-partition prefetch queue.
    pub(crate) fn prefetch_capacity(&self) -> usize {
        self.max_prefetch_batches - 1
    }
}
