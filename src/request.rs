//! Requests carried from the public surface to the consumer actor.

use std::collections::BTreeSet;

use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::record::RawRecord;
use crate::types::{Offsets, PartitionStreamId, StreamId, TopicPartition};

/// One-shot completion for a request that answers with a result.
pub(crate) type ReplySink<T> = oneshot::Sender<Result<T, Error>>;

/// How the actor answered a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchOutcome {
    /// Records for the requested partition, in offset order.
    Delivered,
    /// The partition was revoked (or the fetch was stale); the stream ends.
    Revoked,
    /// Consumption stopped; the stream drains what it has and ends.
    Stopped,
}

/// Reply to a fetch: a chunk of raw records plus the reason it completed.
#[derive(Debug)]
pub(crate) struct FetchCompletion {
    pub records: Vec<RawRecord>,
    pub outcome: FetchOutcome,
}

impl FetchCompletion {
    pub fn new(records: Vec<RawRecord>, outcome: FetchOutcome) -> Self {
        Self { records, outcome }
    }
}

/// Whether a commit is driven as soon as the actor dequeues it or rides the
/// next poll cycle. Both complete only after the broker acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitMode {
    Sync,
    Async,
}

/// Assignment changes pushed from the actor to registered listeners.
///
/// Assigned partitions carry the incarnation id the actor allocated for
/// them, which tags every fetch of the partition stream built from the
/// event.
#[derive(Debug, Clone)]
pub(crate) enum RebalanceEvent {
    Assigned(Vec<(TopicPartition, PartitionStreamId)>),
    Revoked(BTreeSet<TopicPartition>),
    /// Consumption stopped or the consumer is shutting down; no further
    /// events follow.
    Stopped,
}

/// A listener registration riding an `Assignment` request.
pub(crate) struct ListenerRegistration {
    /// Set for the stream surface (fetch-bearing); `None` for observers
    /// such as the assignment stream.
    pub stream: Option<StreamId>,
    pub events: mpsc::UnboundedSender<RebalanceEvent>,
}

pub(crate) enum Request {
    Subscribe {
        topics: Vec<String>,
        sink: ReplySink<()>,
    },
    SubscribePattern {
        pattern: String,
        sink: ReplySink<()>,
    },
    Assign {
        partitions: BTreeSet<TopicPartition>,
        sink: ReplySink<()>,
    },
    Unsubscribe {
        sink: ReplySink<()>,
    },
    Fetch {
        tp: TopicPartition,
        stream: StreamId,
        incarnation: PartitionStreamId,
        sink: oneshot::Sender<FetchCompletion>,
    },
    Assignment {
        sink: oneshot::Sender<BTreeSet<TopicPartition>>,
        listener: Option<ListenerRegistration>,
    },
    Commit {
        offsets: Offsets,
        mode: CommitMode,
        sink: ReplySink<()>,
    },
    StopConsuming,
    Poll,
}

/// The actor's two inbound queues.
///
/// `requests` is unbounded and carries user-originated work and fetch
/// demand; `polls` has capacity 1 and carries the scheduler's poll tokens.
/// The actor drains `requests` with priority and falls back to `polls`, so
/// user work never waits behind a poll but an idle consumer still polls on
/// schedule.
pub(crate) struct RequestBus {
    pub requests: mpsc::UnboundedReceiver<Request>,
    pub polls: mpsc::Receiver<()>,
}

impl RequestBus {
    pub fn new() -> (mpsc::UnboundedSender<Request>, mpsc::Sender<()>, Self) {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (polls_tx, polls) = mpsc::channel(1);
        (requests_tx, polls_tx, Self { requests, polls })
    }
}
