//! In-process test support.
//!
//! [`MockCluster`] stands in for a broker: topics are vectors of records,
//! group membership is scripted, and rebalances can be forced from the
//! test. The consumer built from it runs the real actor, scheduler, stream
//! and commit machinery against [`MockClient`], which implements the same
//! client interface as the rdkafka-backed one.
//!
//! Intended for driving one live consumer at a time; committed offsets
//! survive in the cluster, so a terminated consumer can be followed by a
//! fresh one resuming from its commits.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};

use crate::client::{ClientEvent, ConsumerClient, SeekTarget};
use crate::config::ConsumerConfig;
use crate::consumer::Consumer;
use crate::deserializer::Deserializer;
use crate::record::RawRecord;
use crate::types::{Offsets, TopicPartition};

#[derive(Default)]
struct ClusterState {
    /// topic name → per-partition logs
    topics: BTreeMap<String, Vec<Vec<RawRecord>>>,
    committed: BTreeMap<TopicPartition, i64>,
    /// Partitions that were paused at least once, for assertions.
    pause_observed: BTreeSet<TopicPartition>,
    /// Rebalance events forced by the test, picked up on the next poll.
    forced: VecDeque<ClientEvent>,
    /// Errors to fail upcoming commits with, in order.
    commit_failures: VecDeque<KafkaError>,
}

#[derive(Default)]
struct SessionState {
    subscription: Vec<String>,
    assigned: BTreeSet<TopicPartition>,
    positions: BTreeMap<TopicPartition, i64>,
    paused: BTreeSet<TopicPartition>,
    joined: bool,
}

/// A scripted broker shared by the test and its consumers.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: impl Into<String>, partitions: i32) {
        let mut state = self.lock();
        state
            .topics
            .entry(topic.into())
            .or_insert_with(|| vec![Vec::new(); partitions as usize]);
    }

    /// Append a record, returning its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> i64 {
        let mut state = self.lock();
        let log = state
            .topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
            .unwrap_or_else(|| panic!("unknown partition {topic}-{partition}"));
        let offset = log.len() as i64;
        log.push(RawRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.map(Bytes::copy_from_slice),
            value: Some(Bytes::copy_from_slice(value)),
            timestamp: Some(1_600_000_000_000 + offset),
            headers: Vec::new(),
        });
        offset
    }

    /// The committed next-offset of a partition, if any.
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.lock().committed.get(tp).copied()
    }

    /// Whether the partition was paused at any point.
    pub fn was_paused(&self, tp: &TopicPartition) -> bool {
        self.lock().pause_observed.contains(tp)
    }

    /// Take a partition away from the consumer, as a rebalance would.
    pub fn revoke_partition(&self, tp: TopicPartition) {
        self.lock()
            .forced
            .push_back(ClientEvent::Revoked(BTreeSet::from([tp])));
    }

    /// Hand a partition (back) to the consumer, as a rebalance would.
    pub fn grant_partition(&self, tp: TopicPartition) {
        self.lock()
            .forced
            .push_back(ClientEvent::Assigned(BTreeSet::from([tp])));
    }

    /// Fail the next commit with the given error.
    pub fn fail_next_commit(&self, error: KafkaError) {
        self.lock().commit_failures.push_back(error);
    }

    /// Build a consumer whose client talks to this cluster.
    pub fn consumer<K, V>(
        &self,
        config: ConsumerConfig,
        key_deserializer: impl Deserializer<K> + 'static,
        value_deserializer: impl Deserializer<V> + 'static,
    ) -> Consumer<K, V, MockClient> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let client = MockClient {
            cluster: Arc::clone(&self.state),
            session: Mutex::new(SessionState::default()),
            events: events_tx,
        };
        Consumer::from_parts(
            config,
            client,
            events_rx,
            None,
            Arc::new(key_deserializer),
            Arc::new(value_deserializer),
        )
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One consumer's view of the mock cluster.
pub struct MockClient {
    cluster: Arc<Mutex<ClusterState>>,
    session: Mutex<SessionState>,
    events: crossbeam_channel::Sender<ClientEvent>,
}

impl MockClient {
    fn with_state<T>(
        &self,
        op: impl FnOnce(&mut ClusterState, &mut SessionState) -> T,
    ) -> T {
        let mut cluster = self
            .cluster
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        op(&mut cluster, &mut session)
    }

    fn start_position(cluster: &ClusterState, tp: &TopicPartition) -> i64 {
        cluster.committed.get(tp).copied().unwrap_or(0)
    }
}

impl ConsumerClient for MockClient {
    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaError> {
        self.with_state(|_, session| {
            session.subscription = topics.to_vec();
            session.joined = false;
            Ok(())
        })
    }

    fn subscribe_pattern(&self, pattern: &str) -> Result<(), KafkaError> {
        // Patterns are matched as a literal prefix here, which covers what
        // the tests need.
        let prefix = pattern.trim_start_matches('^').to_string();
        self.with_state(|cluster, session| {
            session.subscription = cluster
                .topics
                .keys()
                .filter(|topic| topic.starts_with(&prefix))
                .cloned()
                .collect();
            session.joined = false;
            Ok(())
        })
    }

    fn assign(&self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError> {
        self.with_state(|cluster, session| {
            session.subscription.clear();
            session.joined = true;
            session.assigned = partitions.clone();
            session.positions = partitions
                .iter()
                .map(|tp| (tp.clone(), Self::start_position(cluster, tp)))
                .collect();
            session.paused.clear();
            Ok(())
        })
    }

    fn unsubscribe(&self) -> Result<(), KafkaError> {
        self.with_state(|_, session| {
            *session = SessionState::default();
            Ok(())
        })
    }

    fn poll(&self, _timeout: Duration, max_records: usize) -> Result<Vec<RawRecord>, KafkaError> {
        self.with_state(|cluster, session| {
            // Join the group on the first poll after a subscription change.
            if !session.joined && !session.subscription.is_empty() {
                session.joined = true;
                let assigned: BTreeSet<TopicPartition> = session
                    .subscription
                    .iter()
                    .filter_map(|topic| cluster.topics.get_key_value(topic))
                    .flat_map(|(topic, partitions)| {
                        (0..partitions.len() as i32)
                            .map(|partition| TopicPartition::new(topic.clone(), partition))
                    })
                    .collect();
                session.assigned = assigned.clone();
                session.positions = assigned
                    .iter()
                    .map(|tp| (tp.clone(), Self::start_position(cluster, tp)))
                    .collect();
                let _ = self.events.send(ClientEvent::Assigned(assigned));
            }

            // Rebalances forced by the test surface inside poll, like the
            // real client's callbacks.
            while let Some(event) = cluster.forced.pop_front() {
                match &event {
                    ClientEvent::Assigned(partitions) => {
                        for tp in partitions {
                            session.assigned.insert(tp.clone());
                            let position = Self::start_position(cluster, tp);
                            session.positions.entry(tp.clone()).or_insert(position);
                        }
                    }
                    ClientEvent::Revoked(partitions) => {
                        for tp in partitions {
                            session.assigned.remove(tp);
                            session.positions.remove(tp);
                            session.paused.remove(tp);
                        }
                    }
                }
                let _ = self.events.send(event);
            }

            let mut records = Vec::new();
            for tp in session.assigned.clone() {
                if session.paused.contains(&tp) {
                    continue;
                }
                let Some(log) = cluster
                    .topics
                    .get(&tp.topic)
                    .and_then(|partitions| partitions.get(tp.partition as usize))
                else {
                    continue;
                };
                let mut position = session.positions.get(&tp).copied().unwrap_or(0);
                while (position as usize) < log.len() && records.len() < max_records {
                    records.push(log[position as usize].clone());
                    position += 1;
                }
                session.positions.insert(tp, position);
                if records.len() >= max_records {
                    break;
                }
            }
            Ok(records)
        })
    }

    fn commit(&self, offsets: &Offsets) -> Result<(), KafkaError> {
        self.with_state(|cluster, _| {
            if let Some(error) = cluster.commit_failures.pop_front() {
                return Err(error);
            }
            for (tp, next_offset) in offsets {
                if !cluster.topics.contains_key(&tp.topic) {
                    return Err(KafkaError::ConsumerCommit(
                        RDKafkaErrorCode::UnknownTopicOrPartition,
                    ));
                }
                cluster.committed.insert(tp.clone(), *next_offset);
            }
            Ok(())
        })
    }

    fn pause(&self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError> {
        self.with_state(|cluster, session| {
            for tp in partitions {
                session.paused.insert(tp.clone());
                cluster.pause_observed.insert(tp.clone());
            }
            Ok(())
        })
    }

    fn resume(&self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError> {
        self.with_state(|_, session| {
            for tp in partitions {
                session.paused.remove(tp);
            }
            Ok(())
        })
    }

    fn seek(
        &self,
        tp: &TopicPartition,
        target: SeekTarget,
        _timeout: Duration,
    ) -> Result<(), KafkaError> {
        self.with_state(|cluster, session| {
            let end = cluster
                .topics
                .get(&tp.topic)
                .and_then(|partitions| partitions.get(tp.partition as usize))
                .map(|log| log.len() as i64)
                .ok_or(KafkaError::Seek("unknown partition".to_string()))?;
            let position = match target {
                SeekTarget::Offset(offset) => offset,
                SeekTarget::Beginning => 0,
                SeekTarget::End => end,
            };
            session.positions.insert(tp.clone(), position);
            Ok(())
        })
    }

    fn position(&self, tp: &TopicPartition) -> Result<Option<i64>, KafkaError> {
        self.with_state(|_, session| Ok(session.positions.get(tp).copied()))
    }

    fn partitions_for(&self, topic: &str, _timeout: Duration) -> Result<Vec<i32>, KafkaError> {
        self.with_state(|cluster, _| {
            cluster
                .topics
                .get(topic)
                .map(|partitions| (0..partitions.len() as i32).collect())
                .ok_or(KafkaError::MetadataFetch(
                    RDKafkaErrorCode::UnknownTopicOrPartition,
                ))
        })
    }

    fn beginning_offsets(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        _timeout: Duration,
    ) -> Result<Offsets, KafkaError> {
        Ok(partitions.iter().map(|tp| (tp.clone(), 0)).collect())
    }

    fn end_offsets(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        _timeout: Duration,
    ) -> Result<Offsets, KafkaError> {
        self.with_state(|cluster, _| {
            Ok(partitions
                .iter()
                .map(|tp| {
                    let end = cluster
                        .topics
                        .get(&tp.topic)
                        .and_then(|logs| logs.get(tp.partition as usize))
                        .map(|log| log.len() as i64)
                        .unwrap_or(0);
                    (tp.clone(), end)
                })
                .collect())
        })
    }
}
