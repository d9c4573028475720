//! Per-partition record streams.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::commit::Committer;
use crate::deserializer::Deserializer;
use crate::error::{DeserializationError, Error};
use crate::record::{CommittableOffset, RawRecord, Record};
use crate::request::{FetchOutcome, Request};
use crate::types::{PartitionStreamId, StreamId, TopicPartition};

/// A stream of records for a single partition, alive for exactly one
/// assignment incarnation.
///
/// The stream ends when the partition is revoked, when consumption stops,
/// when the consumer terminates, or when the subscription it belongs to is
/// superseded. Records are emitted in offset order; a record that fails to
/// decode yields an inline `Err` and the stream continues with the next
/// record.
pub struct PartitionStream<K, V> {
    tp: TopicPartition,
    chunks: mpsc::Receiver<Vec<RawRecord>>,
    current: VecDeque<RawRecord>,
    key_deserializer: Arc<dyn Deserializer<K>>,
    value_deserializer: Arc<dyn Deserializer<V>>,
    committer: Committer,
}

impl<K, V> PartitionStream<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    /// Build the stream and spawn its demand loop.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        tp: TopicPartition,
        stream: StreamId,
        incarnation: PartitionStreamId,
        requests: mpsc::UnboundedSender<Request>,
        prefetch_capacity: usize,
        key_deserializer: Arc<dyn Deserializer<K>>,
        value_deserializer: Arc<dyn Deserializer<V>>,
        committer: Committer,
    ) -> Self {
        // A prefetch capacity of zero means no read-ahead at all: the loop
        // then hands each chunk over rendezvous-style before demanding the
        // next one.
        let (chunks_tx, chunks_rx) = mpsc::channel(prefetch_capacity.max(1));
        tokio::spawn(run_demand_loop(
            tp.clone(),
            stream,
            incarnation,
            requests,
            chunks_tx,
            prefetch_capacity == 0,
        ));
        Self {
            tp,
            chunks: chunks_rx,
            current: VecDeque::new(),
            key_deserializer,
            value_deserializer,
            committer,
        }
    }
}

impl<K, V> PartitionStream<K, V> {
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    fn decode(&self, raw: RawRecord) -> Result<Record<K, V>, Error> {
        let key = self
            .key_deserializer
            .deserialize(&raw.topic, raw.key.as_deref())
            .map_err(|error| decode_error("key", &raw, error))?;
        let value = self
            .value_deserializer
            .deserialize(&raw.topic, raw.value.as_deref())
            .map_err(|error| decode_error("value", &raw, error))?;
        let committable = CommittableOffset::new(
            raw.topic_partition(),
            raw.offset + 1,
            self.committer.clone(),
        );
        Ok(Record::new(key, value, &raw, committable))
    }
}

fn decode_error(
    target: &'static str,
    raw: &RawRecord,
    error: Box<dyn std::error::Error + Send + Sync>,
) -> Error {
    Error::Deserialization(DeserializationError {
        target,
        topic: raw.topic.clone(),
        partition: raw.partition,
        offset: raw.offset,
        message: error.to_string(),
    })
}

impl<K, V> Stream for PartitionStream<K, V> {
    type Item = Result<Record<K, V>, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(raw) = this.current.pop_front() {
                return Poll::Ready(Some(this.decode(raw)));
            }
            match this.chunks.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.current = chunk.into(),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Couples downstream demand to the actor's fetch protocol.
///
/// One fetch is outstanding at a time. Chunks are offered to the bounded
/// prefetch queue, so a slow downstream stops the loop from fetching, which
/// in turn lets the actor buffer and pause the partition. In rendezvous
/// mode the loop reserves the queue slot before fetching, so the next fetch
/// only goes out once the previous chunk was taken downstream. Dropping the
/// chunk sender is the stream's end-of-stream marker.
async fn run_demand_loop(
    tp: TopicPartition,
    stream: StreamId,
    incarnation: PartitionStreamId,
    requests: mpsc::UnboundedSender<Request>,
    chunks: mpsc::Sender<Vec<RawRecord>>,
    rendezvous: bool,
) {
    loop {
        let permit = if rendezvous {
            match chunks.reserve().await {
                Ok(permit) => Some(permit),
                // Downstream finalized; nothing demands records anymore.
                Err(_) => break,
            }
        } else {
            None
        };

        let (sink, completion) = oneshot::channel();
        let sent = requests.send(Request::Fetch {
            tp: tp.clone(),
            stream,
            incarnation,
            sink,
        });
        if sent.is_err() {
            // Actor gone; terminate the stream.
            break;
        }

        let completion = tokio::select! {
            completion = completion => match completion {
                Ok(completion) => completion,
                // Sink dropped without an answer: the consumer shut down.
                Err(_) => break,
            },
            // Downstream finalized while we waited; stop demanding.
            _ = chunks.closed() => break,
        };

        let finished = completion.outcome != FetchOutcome::Delivered;
        if !completion.records.is_empty() {
            match permit {
                Some(permit) => permit.send(completion.records),
                None => {
                    // Suspends when the prefetch queue is full; errs when
                    // the downstream is gone.
                    if chunks.send(completion.records).await.is_err() {
                        break;
                    }
                }
            }
        }
        if finished {
            trace!(%tp, outcome = ?completion.outcome, "partition stream finished");
            break;
        }
    }
}
