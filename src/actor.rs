//! The consumer actor: sole owner of the client-facing request loop.
//!
//! All poll, fetch, commit, subscription and rebalance work funnels through
//! one task that processes a single request at a time. User-originated
//! requests take priority over scheduled polls, and rebalance callbacks are
//! observed between a poll returning and its records being routed, so a
//! revocation is always seen before any record that could follow it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::client::{ClientEvent, ConsumerClient};
use crate::config::{CommitRecovery, ConsumerConfig};
use crate::error::Error;
use crate::handle::ConsumerHandle;
use crate::record::RawRecord;
use crate::request::{
    CommitMode, FetchCompletion, FetchOutcome, ListenerRegistration, RebalanceEvent, ReplySink,
    Request, RequestBus,
};
use crate::types::{Offsets, PartitionStreamId, StreamId, TopicPartition};

/// A fetch waiting for records, keyed by partition in [`ActorState`].
struct PendingFetch {
    stream: StreamId,
    incarnation: PartitionStreamId,
    sink: oneshot::Sender<FetchCompletion>,
}

/// A commit waiting to be driven through the client.
struct PendingCommit {
    offsets: Offsets,
    sink: ReplySink<()>,
    attempt: u32,
}

/// Flow-control calls the state machine asks the actor to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClientAction {
    Pause(BTreeSet<TopicPartition>),
    Resume(BTreeSet<TopicPartition>),
}

/// Book-keeping owned by the actor task. Nothing else reads or writes it.
///
/// State transitions are plain methods that hand back the client calls they
/// require, which keeps them independently testable.
#[derive(Default)]
pub(crate) struct ActorState {
    assigned: BTreeSet<TopicPartition>,
    incarnations: BTreeMap<TopicPartition, PartitionStreamId>,
    fetches: BTreeMap<TopicPartition, PendingFetch>,
    buffered: BTreeMap<TopicPartition, Vec<RawRecord>>,
    paused: BTreeSet<TopicPartition>,
    listeners: Vec<ListenerRegistration>,
    pending_commits: VecDeque<PendingCommit>,
    active_stream: Option<StreamId>,
    stop_consuming: bool,
    next_incarnation: u64,
}

impl ActorState {
    pub fn assigned(&self) -> &BTreeSet<TopicPartition> {
        &self.assigned
    }

    /// Newly assigned partitions get fresh incarnation ids; listeners learn
    /// about them so partition streams can be built.
    fn on_assigned(&mut self, partitions: BTreeSet<TopicPartition>) {
        let mut added = Vec::new();
        for tp in partitions {
            // An assignment we already hold keeps its incarnation.
            if !self.assigned.insert(tp.clone()) {
                continue;
            }
            if self.stop_consuming {
                continue;
            }
            let incarnation = PartitionStreamId(self.next_incarnation);
            self.next_incarnation += 1;
            self.incarnations.insert(tp.clone(), incarnation);
            added.push((tp, incarnation));
        }
        if !added.is_empty() {
            debug!(count = added.len(), "partitions joined the assignment");
            self.notify_listeners(RebalanceEvent::Assigned(added));
        }
    }

    /// Revoked partitions complete their pending fetch with whatever was
    /// buffered; anything buffered without a waiting fetch is dropped, the
    /// broker re-delivers it to the partition's next owner.
    fn on_revoked(&mut self, partitions: BTreeSet<TopicPartition>) {
        let mut revoked = BTreeSet::new();
        for tp in partitions {
            if !self.assigned.remove(&tp) {
                continue;
            }
            self.incarnations.remove(&tp);
            self.paused.remove(&tp);
            let buffered = self.buffered.remove(&tp).unwrap_or_default();
            if let Some(fetch) = self.fetches.remove(&tp) {
                let _ = fetch
                    .sink
                    .send(FetchCompletion::new(buffered, FetchOutcome::Revoked));
            } else if !buffered.is_empty() {
                debug!(%tp, count = buffered.len(), "dropping buffered records of revoked partition");
            }
            revoked.insert(tp);
        }
        if !revoked.is_empty() {
            debug!(count = revoked.len(), "partitions left the assignment");
            self.notify_listeners(RebalanceEvent::Revoked(revoked));
        }
    }

    /// Accept or reject one fetch. Stale fetches (wrong stream, wrong
    /// incarnation, unassigned partition) are answered immediately so the
    /// requesting stream terminates.
    fn handle_fetch(
        &mut self,
        tp: TopicPartition,
        stream: StreamId,
        incarnation: PartitionStreamId,
        sink: oneshot::Sender<FetchCompletion>,
    ) -> Option<ClientAction> {
        if self.stop_consuming {
            let _ = sink.send(FetchCompletion::new(Vec::new(), FetchOutcome::Stopped));
            return None;
        }
        let live = self.active_stream == Some(stream)
            && self.incarnations.get(&tp) == Some(&incarnation);
        if !live {
            let _ = sink.send(FetchCompletion::new(Vec::new(), FetchOutcome::Revoked));
            return None;
        }
        if let Some(buffered) = self.buffered.remove(&tp) {
            let _ = sink.send(FetchCompletion::new(buffered, FetchOutcome::Delivered));
            if self.paused.remove(&tp) {
                return Some(ClientAction::Resume(BTreeSet::from([tp])));
            }
            return None;
        }
        // At most one outstanding fetch per incarnation; a duplicate
        // replaces the previous sink.
        self.fetches.insert(
            tp,
            PendingFetch {
                stream,
                incarnation,
                sink,
            },
        );
        None
    }

    /// Route one poll's records: satisfy waiting fetches, buffer the rest
    /// and pause their partitions until demand returns.
    fn route_records(&mut self, records: Vec<RawRecord>) -> Option<ClientAction> {
        let mut by_partition: BTreeMap<TopicPartition, Vec<RawRecord>> = BTreeMap::new();
        for record in records {
            by_partition
                .entry(record.topic_partition())
                .or_default()
                .push(record);
        }

        let mut to_pause = BTreeSet::new();
        for (tp, records) in by_partition {
            if !self.assigned.contains(&tp) {
                debug!(%tp, count = records.len(), "discarding records for unassigned partition");
                continue;
            }
            if let Some(fetch) = self.fetches.remove(&tp) {
                let mut chunk = self.buffered.remove(&tp).unwrap_or_default();
                chunk.extend(records);
                let _ = fetch
                    .sink
                    .send(FetchCompletion::new(chunk, FetchOutcome::Delivered));
            } else {
                self.buffered.entry(tp.clone()).or_default().extend(records);
                if self.paused.insert(tp.clone()) {
                    to_pause.insert(tp);
                }
            }
        }
        (!to_pause.is_empty()).then_some(ClientAction::Pause(to_pause))
    }

    /// Stop serving fetches. Pending fetches drain their buffers and end;
    /// listeners are told to close their streams. Commits keep flowing.
    fn stop(&mut self) {
        if self.stop_consuming {
            return;
        }
        self.stop_consuming = true;
        let fetches = std::mem::take(&mut self.fetches);
        for (tp, fetch) in fetches {
            let buffered = self.buffered.remove(&tp).unwrap_or_default();
            let _ = fetch
                .sink
                .send(FetchCompletion::new(buffered, FetchOutcome::Stopped));
        }
        self.notify_listeners(RebalanceEvent::Stopped);
        self.listeners.clear();
    }

    fn register_listener(&mut self, registration: ListenerRegistration) {
        if self.stop_consuming {
            let _ = registration.events.send(RebalanceEvent::Stopped);
            return;
        }
        if let Some(stream) = registration.stream {
            // A fresh stream surface supersedes the previous one: its
            // predecessor is told to stop and its stale fetches will be
            // rejected from now on.
            for old in &self.listeners {
                if old.stream.is_some() {
                    let _ = old.events.send(RebalanceEvent::Stopped);
                }
            }
            self.listeners.retain(|listener| listener.stream.is_none());
            self.active_stream = Some(stream);

            // Fetches parked by the superseded stream must not receive
            // records meant for the new one.
            let stale: Vec<TopicPartition> = self
                .fetches
                .iter()
                .filter(|(_, fetch)| Some(fetch.stream) != self.active_stream)
                .map(|(tp, _)| tp.clone())
                .collect();
            for tp in stale {
                if let Some(fetch) = self.fetches.remove(&tp) {
                    trace!(
                        %tp,
                        stream = fetch.stream.0,
                        incarnation = fetch.incarnation.0,
                        "rejecting fetch of superseded stream"
                    );
                    let _ = fetch
                        .sink
                        .send(FetchCompletion::new(Vec::new(), FetchOutcome::Revoked));
                }
            }

            // Bootstrap the subscriber with the partitions already held.
            let pairs: Vec<_> = self
                .assigned
                .iter()
                .filter_map(|tp| {
                    self.incarnations
                        .get(tp)
                        .map(|incarnation| (tp.clone(), *incarnation))
                })
                .collect();
            if !pairs.is_empty() {
                let _ = registration.events.send(RebalanceEvent::Assigned(pairs));
            }
        }
        self.listeners.push(registration);
    }

    fn notify_listeners(&mut self, event: RebalanceEvent) {
        self.listeners
            .retain(|listener| listener.events.send(event.clone()).is_ok());
    }

    fn queue_commit(&mut self, offsets: Offsets, sink: ReplySink<()>, attempt: u32) {
        self.pending_commits.push_back(PendingCommit {
            offsets,
            sink,
            attempt,
        });
    }

    fn take_commits(&mut self) -> VecDeque<PendingCommit> {
        std::mem::take(&mut self.pending_commits)
    }
}

/// The actor task: consumes the request bus until shutdown or a fatal poll
/// error, then flushes its state so every waiting stream terminates.
pub(crate) struct ConsumerActor<C: ConsumerClient> {
    handle: ConsumerHandle<C>,
    bus: RequestBus,
    events: crossbeam_channel::Receiver<ClientEvent>,
    state: ActorState,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<C: ConsumerClient> ConsumerActor<C> {
    pub fn new(
        handle: ConsumerHandle<C>,
        bus: RequestBus,
        events: crossbeam_channel::Receiver<ClientEvent>,
        config: ConsumerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handle,
            bus,
            events,
            state: ActorState::default(),
            config,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), Error> {
        debug!("consumer actor started");
        let result = self.serve().await;
        // Whatever ends the loop, leave no stream hanging.
        self.state.stop();
        if let Err(reason) = &result {
            warn!(%reason, "consumer actor failed");
        } else {
            debug!("consumer actor stopped");
        }
        result
    }

    async fn serve(&mut self) -> Result<(), Error> {
        loop {
            let request = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Ok(()),
                Some(request) = self.bus.requests.recv() => request,
                Some(()) = self.bus.polls.recv() => Request::Poll,
                else => return Ok(()),
            };
            self.dispatch(request).await?;
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<(), Error> {
        match request {
            Request::Subscribe { topics, sink } => {
                info!(?topics, "subscribing");
                let result = self
                    .handle
                    .blocking(move |client| client.subscribe(&topics))
                    .await;
                let _ = sink.send(flatten_client(result));
            }
            Request::SubscribePattern { pattern, sink } => {
                info!(%pattern, "subscribing to pattern");
                let result = self
                    .handle
                    .blocking(move |client| client.subscribe_pattern(&pattern))
                    .await;
                let _ = sink.send(flatten_client(result));
            }
            Request::Assign { partitions, sink } => {
                info!(count = partitions.len(), "assigning partitions");
                let to_assign = partitions.clone();
                let result = flatten_client(
                    self.handle
                        .blocking(move |client| client.assign(&to_assign))
                        .await,
                );
                if result.is_ok() {
                    // Manual assignment bypasses the group coordinator, so
                    // no rebalance callback will fire; reflect the change
                    // in actor state directly.
                    let current = self.state.assigned().clone();
                    let removed: BTreeSet<_> =
                        current.difference(&partitions).cloned().collect();
                    let added: BTreeSet<_> = partitions.difference(&current).cloned().collect();
                    self.state.on_revoked(removed);
                    self.state.on_assigned(added);
                }
                let _ = sink.send(result);
            }
            Request::Unsubscribe { sink } => {
                info!("unsubscribing");
                let result =
                    flatten_client(self.handle.blocking(|client| client.unsubscribe()).await);
                if result.is_ok() {
                    let current = self.state.assigned().clone();
                    self.state.on_revoked(current);
                }
                let _ = sink.send(result);
            }
            Request::Fetch {
                tp,
                stream,
                incarnation,
                sink,
            } => {
                let action = self.state.handle_fetch(tp, stream, incarnation, sink);
                self.apply(action).await;
            }
            Request::Assignment { sink, listener } => {
                if let Some(registration) = listener {
                    self.state.register_listener(registration);
                }
                let _ = sink.send(self.state.assigned().clone());
            }
            Request::Commit {
                offsets,
                mode,
                sink,
            } => {
                self.state.queue_commit(offsets, sink, 1);
                if mode == CommitMode::Sync {
                    self.drive_commits().await;
                }
            }
            Request::StopConsuming => {
                info!("stopping consumption; in-flight commits still complete");
                self.state.stop();
            }
            Request::Poll => self.poll().await?,
        }
        Ok(())
    }

    /// One poll cycle: client poll, rebalance events, record routing, flow
    /// control, commits. A client error from the poll itself is fatal to
    /// the consumer.
    async fn poll(&mut self) -> Result<(), Error> {
        let timeout = self.config.poll_timeout;
        let max_records = self.config.max_poll_records;
        let records = flatten_client(
            self.handle
                .blocking(move |client| client.poll(timeout, max_records))
                .await,
        )?;

        // Rebalance callbacks fired inside the poll call; apply them before
        // routing so nothing lands on a dead incarnation.
        while let Ok(event) = self.events.try_recv() {
            match event {
                ClientEvent::Assigned(partitions) => self.state.on_assigned(partitions),
                ClientEvent::Revoked(partitions) => self.state.on_revoked(partitions),
            }
        }

        if !records.is_empty() {
            trace!(count = records.len(), "routing polled records");
        }
        let action = self.state.route_records(records);
        self.apply(action).await;

        self.drive_commits().await;
        Ok(())
    }

    async fn apply(&mut self, action: Option<ClientAction>) {
        let Some(action) = action else { return };
        let result = match action {
            ClientAction::Pause(partitions) => {
                trace!(count = partitions.len(), "pausing partitions");
                self.handle
                    .blocking(move |client| client.pause(&partitions))
                    .await
            }
            ClientAction::Resume(partitions) => {
                trace!(count = partitions.len(), "resuming partitions");
                self.handle
                    .blocking(move |client| client.resume(&partitions))
                    .await
            }
        };
        if let Err(reason) = flatten_client(result) {
            warn!(%reason, "failed to adjust partition flow control");
        }
    }

    async fn drive_commits(&mut self) {
        let mut pending = self.state.take_commits();
        while let Some(commit) = pending.pop_front() {
            let offsets = commit.offsets.clone();
            let result = self
                .handle
                .blocking(move |client| client.commit(&offsets))
                .await;
            match flatten_client(result) {
                Ok(()) => {
                    let _ = commit.sink.send(Ok(()));
                }
                Err(Error::Kafka(error)) if self.retry_commit(&error, commit.attempt) => {
                    debug!(%error, attempt = commit.attempt, "commit rejected; retrying on a later poll");
                    self.state
                        .queue_commit(commit.offsets, commit.sink, commit.attempt + 1);
                }
                Err(reason) => {
                    let _ = commit.sink.send(Err(reason));
                }
            }
        }
    }

    fn retry_commit(&self, error: &KafkaError, attempt: u32) -> bool {
        let max_attempts = match self.config.commit_recovery {
            CommitRecovery::Default { max_attempts } => max_attempts,
            CommitRecovery::None => return false,
        };
        attempt < max_attempts
            && matches!(
                error,
                KafkaError::ConsumerCommit(code) if *code == RDKafkaErrorCode::RebalanceInProgress
            )
    }
}

fn flatten_client<T>(result: Result<Result<T, KafkaError>, Error>) -> Result<T, Error> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(Error::Kafka(error)),
        Err(error) => Err(error),
    }
}
