use thiserror::Error;

/// Errors surfaced by the consumer.
///
/// The enum is `Clone` because the terminal outcome of the consumer is
/// broadcast to every task racing against termination.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// The consumer terminated before an awaited operation completed.
    #[error("consumer has shut down")]
    Shutdown,

    /// A record could not be decoded. Delivered inline on the partition
    /// stream; the stream and the consumer keep running.
    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    /// A commit was not acknowledged within the configured commit timeout.
    #[error("commit was not acknowledged within the commit timeout")]
    CommitTimeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Record-level decode failure, with the coordinates of the offending record.
#[derive(Error, Debug, Clone)]
#[error("failed to deserialize record {target} at {topic}-{partition} offset {offset}: {message}")]
pub struct DeserializationError {
    /// Which half of the record failed: "key" or "value"
    pub target: &'static str,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;
