//! A scripted log used for replaying captured messages and in tests.

use std::collections::{BTreeMap, VecDeque};
use std::io::BufRead;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::ingestion::{
    ConsumerEvent, LogConsumer, LogMessage, MessageBatch, TopicPartition, TransportError,
};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read replay input: {0}")]
    Read(#[from] std::io::Error),
}

#[derive(Default)]
struct ReplayState {
    pending: VecDeque<ConsumerEvent>,
    committed: BTreeMap<TopicPartition, i64>,
    heartbeats: usize,
    rejected_commits: u32,
    close_when_drained: bool,
}

#[derive(Default)]
pub struct InMemoryLogConsumer {
    state: Mutex<ReplayState>,
}

impl InMemoryLogConsumer {
    /// Reports `ConsumerEvent::Closed` once every scripted event has been polled.
    pub fn closing_when_drained() -> Self {
        let consumer = Self::default();
        consumer.with_state(|state| state.close_when_drained = true);
        consumer
    }

    /// One message per non-blank line, on partition 0 of `topic`, offsets counting from 0.
    pub fn from_jsonl(
        reader: impl BufRead,
        topic: &str,
        max_batch_messages: usize,
    ) -> Result<Self, ReplayError> {
        let partition = TopicPartition::new(topic, 0);
        let mut messages = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            messages.push(LogMessage {
                offset: messages.len() as i64,
                key: None,
                payload: line.into_bytes(),
                timestamp: None,
            });
        }

        let consumer = Self::closing_when_drained();
        consumer.push_event(ConsumerEvent::Assigned(vec![partition.clone()]));
        for chunk in messages.chunks(max_batch_messages.max(1)) {
            consumer.push_event(ConsumerEvent::Batches(vec![MessageBatch {
                partition: partition.clone(),
                messages: chunk.to_vec(),
            }]));
        }
        Ok(consumer)
    }

    pub fn push_event(&self, event: ConsumerEvent) {
        self.with_state(|state| state.pending.push_back(event));
    }

    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.with_state(|state| state.committed.get(partition).copied())
    }

    /// The next `count` commits fail as if the broker had refused them.
    pub fn reject_commits(&self, count: u32) {
        self.with_state(|state| state.rejected_commits = count);
    }

    pub fn heartbeats(&self) -> usize {
        self.with_state(|state| state.heartbeats)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ReplayState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl LogConsumer for InMemoryLogConsumer {
    async fn poll(&self) -> Result<ConsumerEvent, TransportError> {
        Ok(self.with_state(|state| match state.pending.pop_front() {
            Some(event) => event,
            None if state.close_when_drained => ConsumerEvent::Closed,
            None => ConsumerEvent::Idle,
        }))
    }

    async fn commit(&self, partition: &TopicPartition, offset: i64) -> Result<(), TransportError> {
        self.with_state(|state| {
            if state.rejected_commits > 0 {
                state.rejected_commits -= 1;
                return Err(TransportError::Commit(format!("commit of {partition}@{offset} rejected")));
            }
            let entry = state.committed.entry(partition.clone()).or_insert(offset);
            *entry = (*entry).max(offset);
            Ok(())
        })
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        self.with_state(|state| state.heartbeats += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::InMemoryLogConsumer;
    use crate::ingestion::{ConsumerEvent, LogConsumer};

    #[tokio::test]
    async fn jsonl_lines_become_batches_then_the_log_closes() {
        let input = Cursor::new("{\"a\":1}\n\n{\"a\":2}\n{\"a\":3}\n");
        let consumer = InMemoryLogConsumer::from_jsonl(input, "items", 2).expect("replay");

        assert!(matches!(consumer.poll().await, Ok(ConsumerEvent::Assigned(_))));
        let Ok(ConsumerEvent::Batches(first)) = consumer.poll().await else {
            panic!("expected a batch");
        };
        assert_eq!(first[0].messages.len(), 2);
        assert_eq!(first[0].last_offset(), Some(1));
        let Ok(ConsumerEvent::Batches(second)) = consumer.poll().await else {
            panic!("expected a batch");
        };
        assert_eq!(second[0].messages[0].payload, b"{\"a\":3}".to_vec());
        assert!(matches!(consumer.poll().await, Ok(ConsumerEvent::Closed)));
    }
}
