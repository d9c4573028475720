//! The public consumer surface.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::StreamExt;
use futures::Stream;
use rdkafka::error::KafkaError;
use rdkafka::statistics::Statistics;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::actor::ConsumerActor;
use crate::client::{ClientEvent, ConsumerClient, RdClient, SeekTarget};
use crate::commit::Committer;
use crate::config::ConsumerConfig;
use crate::deserializer::Deserializer;
use crate::error::{Error, Result};
use crate::handle::ConsumerHandle;
use crate::lifecycle::Lifecycle;
use crate::partition_stream::PartitionStream;
use crate::record::Record;
use crate::request::{Request, RequestBus};
use crate::scheduler::run_poll_scheduler;
use crate::streams::{self, StreamFactory};
use crate::types::{Offsets, StreamId, TopicPartition};

/// Default deadline for direct client queries (seek, metadata, watermarks).
const CLIENT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// A streaming Kafka consumer.
///
/// One underlying client, one actor task serializing every client call, and
/// a stream surface that fans records out per partition with backpressure.
/// The stream surface is meant for a single subscriber at a time: a second
/// call to [`Consumer::stream`] (or its partitioned variants) supersedes the
/// first, whose streams then terminate.
///
/// Must be created from within a tokio runtime.
pub struct Consumer<K, V, C: ConsumerClient = RdClient> {
    handle: ConsumerHandle<C>,
    requests: mpsc::UnboundedSender<Request>,
    lifecycle: Lifecycle,
    config: ConsumerConfig,
    committer: Committer,
    key_deserializer: Arc<dyn Deserializer<K>>,
    value_deserializer: Arc<dyn Deserializer<V>>,
    stats: Option<Arc<Mutex<Option<Statistics>>>>,
    next_stream_id: AtomicU64,
}

impl<K, V> Consumer<K, V, RdClient> {
    /// Create a consumer connected to a real broker.
    pub fn new(
        config: ConsumerConfig,
        key_deserializer: impl Deserializer<K> + 'static,
        value_deserializer: impl Deserializer<V> + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let (client, events, stats) = RdClient::build(&config)?;
        Ok(Self::from_parts(
            config,
            client,
            events,
            Some(stats),
            Arc::new(key_deserializer),
            Arc::new(value_deserializer),
        ))
    }
}

impl<K, V, C: ConsumerClient> Consumer<K, V, C> {
    pub(crate) fn from_parts(
        config: ConsumerConfig,
        client: C,
        events: crossbeam_channel::Receiver<ClientEvent>,
        stats: Option<Arc<Mutex<Option<Statistics>>>>,
        key_deserializer: Arc<dyn Deserializer<K>>,
        value_deserializer: Arc<dyn Deserializer<V>>,
    ) -> Self {
        let handle = ConsumerHandle::new(client);
        let (requests_tx, polls_tx, bus) = RequestBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let actor = ConsumerActor::new(
            handle.clone(),
            bus,
            events,
            config.clone(),
            shutdown_rx.clone(),
        );
        let scheduler = run_poll_scheduler(polls_tx, config.poll_interval, shutdown_rx);
        let lifecycle = Lifecycle::spawn(actor.run(), scheduler, shutdown_tx);
        let committer = Committer::new(
            requests_tx.clone(),
            lifecycle.termination_watch(),
            config.commit_timeout,
        );
        debug!(group = %config.group_id, "consumer started");
        Self {
            handle,
            requests: requests_tx,
            lifecycle,
            config,
            committer,
            key_deserializer,
            value_deserializer,
            stats,
            next_stream_id: AtomicU64::new(0),
        }
    }

    // ---- subscription management (serialized through the actor) ----

    /// Subscribe to the given topics; the group coordinator assigns
    /// partitions.
    pub async fn subscribe<I, T>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(Error::InvalidConfig(
                "subscribe requires at least one topic".into(),
            ));
        }
        let (sink, reply) = oneshot::channel();
        self.submit(Request::Subscribe { topics, sink }, reply).await
    }

    /// Subscribe to every topic matching the regex pattern.
    pub async fn subscribe_pattern(&self, pattern: impl Into<String>) -> Result<()> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(Error::InvalidConfig(
                "subscribe_pattern requires a pattern".into(),
            ));
        }
        let (sink, reply) = oneshot::channel();
        self.submit(Request::SubscribePattern { pattern, sink }, reply)
            .await
    }

    /// Assign a fixed set of partitions, bypassing the group coordinator.
    pub async fn assign(
        &self,
        partitions: impl IntoIterator<Item = TopicPartition>,
    ) -> Result<()> {
        let partitions: BTreeSet<TopicPartition> = partitions.into_iter().collect();
        if partitions.is_empty() {
            return Err(Error::InvalidConfig(
                "assign requires at least one partition".into(),
            ));
        }
        let (sink, reply) = oneshot::channel();
        self.submit(Request::Assign { partitions, sink }, reply)
            .await
    }

    /// Assign the given partition indexes of one topic.
    pub async fn assign_topic_partitions(
        &self,
        topic: impl Into<String>,
        partitions: impl IntoIterator<Item = i32>,
    ) -> Result<()> {
        let topic = topic.into();
        self.assign(
            partitions
                .into_iter()
                .map(|partition| TopicPartition::new(topic.clone(), partition)),
        )
        .await
    }

    /// Assign every partition of one topic.
    pub async fn assign_topic(&self, topic: impl Into<String>) -> Result<()> {
        let topic = topic.into();
        let partitions = self.partitions_for(&topic).await?;
        self.assign_topic_partitions(topic, partitions).await
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        let (sink, reply) = oneshot::channel();
        self.submit(Request::Unsubscribe { sink }, reply).await
    }

    /// The currently assigned partitions, as the actor sees them.
    pub async fn assignment(&self) -> Result<BTreeSet<TopicPartition>> {
        let (sink, reply) = oneshot::channel();
        self.requests
            .send(Request::Assignment {
                sink,
                listener: None,
            })
            .map_err(|_| Error::Shutdown)?;
        let mut termination = self.lifecycle.termination_watch();
        tokio::select! {
            reply = reply => reply.map_err(|_| Error::Shutdown),
            _ = termination.wait() => Err(Error::Shutdown),
        }
    }

    // ---- offset queries and seeks (safe alongside poll, serialized by the
    //      client handle) ----

    /// Move the fetch position of an assigned partition.
    pub async fn seek(&self, tp: TopicPartition, offset: i64) -> Result<()> {
        self.client_op(move |client| client.seek(&tp, SeekTarget::Offset(offset), CLIENT_OP_TIMEOUT))
            .await
    }

    pub async fn seek_to_beginning(
        &self,
        partitions: impl IntoIterator<Item = TopicPartition>,
    ) -> Result<()> {
        self.seek_all(partitions, SeekTarget::Beginning).await
    }

    pub async fn seek_to_end(
        &self,
        partitions: impl IntoIterator<Item = TopicPartition>,
    ) -> Result<()> {
        self.seek_all(partitions, SeekTarget::End).await
    }

    async fn seek_all(
        &self,
        partitions: impl IntoIterator<Item = TopicPartition>,
        target: SeekTarget,
    ) -> Result<()> {
        let partitions: Vec<TopicPartition> = partitions.into_iter().collect();
        self.client_op(move |client| {
            for tp in &partitions {
                client.seek(tp, target, CLIENT_OP_TIMEOUT)?;
            }
            Ok(())
        })
        .await
    }

    /// The next offset that will be fetched for the partition, if known.
    ///
    /// Unlike the metadata and watermark queries there is no timeout
    /// variant: the client answers this from its in-memory fetch state
    /// without touching the broker.
    pub async fn position(&self, tp: TopicPartition) -> Result<Option<i64>> {
        self.client_op(move |client| client.position(&tp)).await
    }

    /// Partition indexes of a topic.
    pub async fn partitions_for(&self, topic: impl Into<String>) -> Result<Vec<i32>> {
        self.partitions_for_with_timeout(topic, CLIENT_OP_TIMEOUT)
            .await
    }

    pub async fn partitions_for_with_timeout(
        &self,
        topic: impl Into<String>,
        timeout: Duration,
    ) -> Result<Vec<i32>> {
        let topic = topic.into();
        self.client_op(move |client| client.partitions_for(&topic, timeout))
            .await
    }

    /// Earliest available offsets of the given partitions.
    pub async fn beginning_offsets(
        &self,
        partitions: impl IntoIterator<Item = TopicPartition>,
    ) -> Result<Offsets> {
        self.beginning_offsets_with_timeout(partitions, CLIENT_OP_TIMEOUT)
            .await
    }

    pub async fn beginning_offsets_with_timeout(
        &self,
        partitions: impl IntoIterator<Item = TopicPartition>,
        timeout: Duration,
    ) -> Result<Offsets> {
        let partitions: BTreeSet<_> = partitions.into_iter().collect();
        self.client_op(move |client| client.beginning_offsets(&partitions, timeout))
            .await
    }

    /// Offsets one past the last record of the given partitions.
    pub async fn end_offsets(
        &self,
        partitions: impl IntoIterator<Item = TopicPartition>,
    ) -> Result<Offsets> {
        self.end_offsets_with_timeout(partitions, CLIENT_OP_TIMEOUT)
            .await
    }

    pub async fn end_offsets_with_timeout(
        &self,
        partitions: impl IntoIterator<Item = TopicPartition>,
        timeout: Duration,
    ) -> Result<Offsets> {
        let partitions: BTreeSet<_> = partitions.into_iter().collect();
        self.client_op(move |client| client.end_offsets(&partitions, timeout))
            .await
    }

    /// The latest statistics snapshot reported by the client, if any.
    pub fn metrics(&self) -> Option<Statistics> {
        let slot = self.stats.as_ref()?;
        slot.lock().ok().and_then(|stats| stats.clone())
    }

    // ---- commits ----

    /// Commit next-offsets and wait for the broker's acknowledgement.
    pub async fn commit_sync(&self, offsets: Offsets) -> Result<()> {
        self.committer.commit_sync(offsets).await
    }

    /// Commit next-offsets on the next poll cycle. Completes only after the
    /// broker acknowledged, like [`Consumer::commit_sync`]; the difference
    /// is when the commit is driven, not whether it is confirmed.
    pub async fn commit_async(&self, offsets: Offsets) -> Result<()> {
        self.committer.commit_async(offsets).await
    }

    // ---- lifecycle ----

    /// Stop serving fetches and end all streams, but keep the consumer
    /// alive: commits already submitted (and new ones) still complete.
    pub fn stop_consuming(&self) {
        let _ = self.requests.send(Request::StopConsuming);
    }

    /// Tear the consumer down. Streams end, racing operations observe
    /// [`Error::Shutdown`].
    pub fn terminate(&self) {
        self.lifecycle.terminate();
    }

    /// Wait until the consumer has terminated; returns the actor's fatal
    /// error if it crashed.
    pub async fn await_termination(&self) -> Result<()> {
        self.lifecycle.termination_watch().wait().await
    }

    // ---- plumbing ----

    async fn submit(
        &self,
        request: Request,
        reply: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        self.requests.send(request).map_err(|_| Error::Shutdown)?;
        let mut termination = self.lifecycle.termination_watch();
        tokio::select! {
            reply = reply => reply.unwrap_or(Err(Error::Shutdown)),
            _ = termination.wait() => Err(Error::Shutdown),
        }
    }

    async fn client_op<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> std::result::Result<T, KafkaError> + Send + 'static,
    {
        match self.handle.blocking(op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Error::Kafka(error)),
            Err(error) => Err(error),
        }
    }
}

impl<K, V, C> Consumer<K, V, C>
where
    K: Send + 'static,
    V: Send + 'static,
    C: ConsumerClient,
{
    /// Successive maps of newly assigned partitions to their record
    /// streams. Each rebalance that grants partitions emits one map.
    pub fn partitions_map_stream(
        &self,
    ) -> impl Stream<Item = BTreeMap<TopicPartition, PartitionStream<K, V>>> + Send {
        self.stream_factory().partitions_map_stream()
    }

    /// Partition streams, flattened out of the assignment maps in partition
    /// order.
    pub fn partitioned_stream(&self) -> impl Stream<Item = PartitionStream<K, V>> + Send {
        self.stream_factory()
            .partitions_map_stream()
            .flat_map(|map| futures::stream::iter(map.into_values()))
    }

    /// All records of all assigned partitions as one stream. Ordering is
    /// preserved within each partition, not across partitions.
    pub fn stream(&self) -> impl Stream<Item = Result<Record<K, V>>> + Send {
        self.partitioned_stream().flatten_unordered(None)
    }

    /// Distinct successive assignment snapshots, starting with the current
    /// one.
    pub fn assignment_stream(&self) -> impl Stream<Item = BTreeSet<TopicPartition>> + Send {
        streams::assignment_stream(&self.requests)
    }

    fn stream_factory(&self) -> StreamFactory<K, V> {
        StreamFactory {
            requests: self.requests.clone(),
            stream_id: StreamId(self.next_stream_id.fetch_add(1, Ordering::Relaxed)),
            prefetch_capacity: self.config.prefetch_capacity(),
            key_deserializer: Arc::clone(&self.key_deserializer),
            value_deserializer: Arc::clone(&self.value_deserializer),
            committer: self.committer.clone(),
        }
    }
}
