//! Assignment-driven stream surfaces.
//!
//! The factory listens to the actor's rebalance events and turns each
//! assignment into a map of fresh partition streams; the assignment stream
//! mirrors the evolving partition set for observers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::commit::Committer;
use crate::deserializer::Deserializer;
use crate::partition_stream::PartitionStream;
use crate::request::{ListenerRegistration, RebalanceEvent, Request};
use crate::types::{StreamId, TopicPartition};

/// Everything needed to build partition streams for one subscription.
pub(crate) struct StreamFactory<K, V> {
    pub requests: mpsc::UnboundedSender<Request>,
    pub stream_id: StreamId,
    pub prefetch_capacity: usize,
    pub key_deserializer: Arc<dyn Deserializer<K>>,
    pub value_deserializer: Arc<dyn Deserializer<V>>,
    pub committer: Committer,
}

impl<K, V> StreamFactory<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    /// Register with the actor and emit one map of newly created partition
    /// streams per assignment event. The stream ends on `stop_consuming`,
    /// on termination, or when a newer subscription supersedes this one.
    pub fn partitions_map_stream(
        self,
    ) -> UnboundedReceiverStream<BTreeMap<TopicPartition, PartitionStream<K, V>>> {
        let StreamFactory {
            requests,
            stream_id,
            prefetch_capacity,
            key_deserializer,
            value_deserializer,
            committer,
        } = self;

        let (maps_tx, maps_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        // The snapshot reply is unused here: the actor bootstraps a
        // fetch-bearing listener by replaying the current assignment as an
        // event, which carries the incarnation ids the snapshot lacks.
        let (snapshot_tx, _snapshot_rx) = oneshot::channel();
        let registered = requests.send(Request::Assignment {
            sink: snapshot_tx,
            listener: Some(ListenerRegistration {
                stream: Some(stream_id),
                events: events_tx,
            }),
        });
        if registered.is_err() {
            // Consumer already gone; the returned stream is empty.
            return UnboundedReceiverStream::new(maps_rx);
        }

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    RebalanceEvent::Assigned(pairs) => {
                        let mut map = BTreeMap::new();
                        for (tp, incarnation) in pairs {
                            let stream = PartitionStream::spawn(
                                tp.clone(),
                                stream_id,
                                incarnation,
                                requests.clone(),
                                prefetch_capacity,
                                Arc::clone(&key_deserializer),
                                Arc::clone(&value_deserializer),
                                committer.clone(),
                            );
                            map.insert(tp, stream);
                        }
                        if !map.is_empty() && maps_tx.send(map).is_err() {
                            // Downstream dropped the map stream; existing
                            // partition streams keep running on their own.
                            break;
                        }
                    }
                    RebalanceEvent::Revoked(_) => {
                        // Revoked partition streams terminate themselves
                        // through the fetch protocol.
                    }
                    RebalanceEvent::Stopped => break,
                }
            }
            debug!(stream = stream_id.0, "partition stream factory stopped");
        });

        UnboundedReceiverStream::new(maps_rx)
    }
}

/// Mirror of the current assignment, emitting each distinct snapshot once.
pub(crate) fn assignment_stream(
    requests: &mpsc::UnboundedSender<Request>,
) -> UnboundedReceiverStream<BTreeSet<TopicPartition>> {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = oneshot::channel();
    let registered = requests.send(Request::Assignment {
        sink: snapshot_tx,
        listener: Some(ListenerRegistration {
            stream: None,
            events: events_tx,
        }),
    });
    if registered.is_err() {
        return UnboundedReceiverStream::new(out_rx);
    }

    tokio::spawn(async move {
        // Snapshot and listener are installed in one serialized actor step,
        // so every event already queued behind the snapshot is newer than
        // it; replaying snapshot-then-deltas is race-free.
        let mut current = match snapshot_rx.await {
            Ok(snapshot) => snapshot,
            Err(_) => return,
        };
        if out_tx.send(current.clone()).is_err() {
            return;
        }
        while let Some(event) = events_rx.recv().await {
            let next = match event {
                RebalanceEvent::Assigned(pairs) => {
                    let mut next = current.clone();
                    next.extend(pairs.into_iter().map(|(tp, _)| tp));
                    next
                }
                RebalanceEvent::Revoked(partitions) => {
                    current.difference(&partitions).cloned().collect()
                }
                RebalanceEvent::Stopped => break,
            };
            if next != current {
                current = next;
                if out_tx.send(current.clone()).is_err() {
                    break;
                }
            }
        }
    });

    UnboundedReceiverStream::new(out_rx)
}
