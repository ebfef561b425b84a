//! Log-driven ingestion: transport abstractions, the partition runner, and the two batch
//! handlers (item processing and cold storage).

pub mod cold_storage;
pub mod items;
pub mod object_store;
pub mod replay;
pub mod runner;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::{Classify, ErrorClass, StoreError};
use crate::rule_engine::RuleEngineError;

pub use cold_storage::{ColdStorageBatcher, ColdStorageError};
pub use items::ItemProcessingPipeline;
pub use replay::InMemoryLogConsumer;
pub use runner::{ConsumerRunner, RunnerSettings};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self { topic: topic.into(), partition }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogMessage {
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Messages from a single partition, in offset order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageBatch {
    pub partition: TopicPartition,
    pub messages: Vec<LogMessage>,
}

impl MessageBatch {
    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(|message| message.offset)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// At most one batch per partition.
    Batches(Vec<MessageBatch>),
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
    Idle,
    /// The log has nothing more to deliver and never will.
    Closed,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("log poll failed: {0}")]
    Poll(String),
    #[error("offset commit failed: {0}")]
    Commit(String),
    #[error("heartbeat failed: {0}")]
    Heartbeat(String),
}

#[async_trait]
pub trait LogConsumer: Send + Sync {
    async fn poll(&self) -> Result<ConsumerEvent, TransportError>;

    /// `offset` is the next offset to read, i.e. one past the last applied message.
    /// Returns only once the log has durably stored it.
    async fn commit(&self, partition: &TopicPartition, offset: i64) -> Result<(), TransportError>;

    async fn heartbeat(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Applies the batch and returns the offset to commit, if any.
    async fn handle_batch(&self, batch: &MessageBatch) -> Result<Option<i64>, IngestionError>;

    /// Called once the offset returned by `handle_batch` is durably committed.
    async fn on_committed(&self, _partition: &TopicPartition, _offset: i64) {}

    /// The full set of partitions this consumer now owns.
    async fn on_assigned(&self, _partitions: &[TopicPartition]) {}

    async fn on_revoked(&self, _partitions: &[TopicPartition]) {}
}

/// A raw message that could not be turned into anything useful.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(partition: &TopicPartition, message: &LogMessage, reason: impl Into<String>) -> Self {
        Self {
            topic: partition.topic.clone(),
            partition: partition.partition,
            offset: message.offset,
            payload: message.payload.clone(),
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn write(&self, letter: DeadLetter) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("item type lookup failed: {0}")]
    Catalog(#[source] StoreError),
    #[error(transparent)]
    Rules(#[from] RuleEngineError),
    #[error("submission outcome could not be logged: {0}")]
    SubmissionLog(#[source] StoreError),
    #[error("dead letter could not be written: {0}")]
    DeadLetter(#[source] StoreError),
    #[error(transparent)]
    ColdStorage(#[from] ColdStorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("batch for {partition} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        partition: String,
        attempts: u32,
        #[source]
        source: Box<IngestionError>,
    },
}

impl Classify for IngestionError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::RetriesExhausted { .. } => ErrorClass::Fatal,
            Self::Rules(error) => match error.class() {
                ErrorClass::Fatal => ErrorClass::Fatal,
                _ => ErrorClass::Transient,
            },
            _ => ErrorClass::Transient,
        }
    }
}
