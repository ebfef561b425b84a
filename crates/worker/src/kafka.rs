//! rdkafka-backed [`LogConsumer`]. Offsets are committed manually and synchronously, after a
//! batch is applied.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::BorrowedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::info;
use triage_core::config::KafkaConfig;
use triage_core::ingestion::{
    ConsumerEvent, LogConsumer, LogMessage, MessageBatch, TopicPartition, TransportError,
};

const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const FILL_TIMEOUT: Duration = Duration::from_millis(5);

pub struct KafkaLogConsumer {
    consumer: Arc<StreamConsumer>,
    max_batch_messages: usize,
    assignment: Mutex<BTreeSet<TopicPartition>>,
    pending: Mutex<VecDeque<ConsumerEvent>>,
}

impl KafkaLogConsumer {
    pub fn new(
        config: &KafkaConfig,
        group_id: &str,
        topic: &str,
        max_batch_messages: usize,
    ) -> Result<Self, TransportError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|error| TransportError::Poll(error.to_string()))?;
        consumer.subscribe(&[topic]).map_err(|error| TransportError::Poll(error.to_string()))?;

        info!(
            event_name = "ingestion.kafka.subscribed",
            topic = %topic,
            consumer_group = %group_id,
            "kafka consumer subscribed"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            max_batch_messages: max_batch_messages.max(1),
            assignment: Mutex::new(BTreeSet::new()),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    fn with_pending<R>(&self, f: impl FnOnce(&mut VecDeque<ConsumerEvent>) -> R) -> R {
        match self.pending.lock() {
            Ok(mut pending) => f(&mut pending),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Queues revoke/assign notices when the group assignment changed since the last poll.
    fn track_assignment(&self) -> Result<(), TransportError> {
        let current: BTreeSet<TopicPartition> = self
            .consumer
            .assignment()
            .map_err(|error| TransportError::Poll(error.to_string()))?
            .elements()
            .iter()
            .map(|element| TopicPartition::new(element.topic(), element.partition()))
            .collect();

        let mut known = match self.assignment.lock() {
            Ok(known) => known,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *known == current {
            return Ok(());
        }
        let revoked: Vec<TopicPartition> = known.difference(&current).cloned().collect();
        let assigned: Vec<TopicPartition> = current.iter().cloned().collect();
        *known = current;
        drop(known);

        self.with_pending(|pending| {
            if !revoked.is_empty() {
                pending.push_back(ConsumerEvent::Revoked(revoked));
            }
            pending.push_back(ConsumerEvent::Assigned(assigned));
        });
        Ok(())
    }
}

fn commit_list(partition: &TopicPartition, offset: i64) -> Result<TopicPartitionList, TransportError> {
    let mut offsets = TopicPartitionList::new();
    offsets
        .add_partition_offset(&partition.topic, partition.partition, Offset::Offset(offset))
        .map_err(|error| TransportError::Commit(error.to_string()))?;
    Ok(offsets)
}

fn to_log_message(message: &BorrowedMessage<'_>) -> (TopicPartition, LogMessage) {
    let partition = TopicPartition::new(message.topic(), message.partition());
    let log_message = LogMessage {
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp: message.timestamp().to_millis().and_then(DateTime::from_timestamp_millis),
    };
    (partition, log_message)
}

#[async_trait]
impl LogConsumer for KafkaLogConsumer {
    async fn poll(&self) -> Result<ConsumerEvent, TransportError> {
        if let Some(event) = self.with_pending(VecDeque::pop_front) {
            return Ok(event);
        }

        let first = match tokio::time::timeout(POLL_TIMEOUT, self.consumer.recv()).await {
            Err(_) => {
                self.track_assignment()?;
                return Ok(self.with_pending(VecDeque::pop_front).unwrap_or(ConsumerEvent::Idle));
            }
            Ok(Err(error)) => return Err(TransportError::Poll(error.to_string())),
            Ok(Ok(message)) => to_log_message(&message),
        };

        let mut grouped: BTreeMap<TopicPartition, Vec<LogMessage>> = BTreeMap::new();
        grouped.entry(first.0).or_default().push(first.1);
        let mut received = 1;
        while received < self.max_batch_messages {
            match tokio::time::timeout(FILL_TIMEOUT, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    let (partition, log_message) = to_log_message(&message);
                    grouped.entry(partition).or_default().push(log_message);
                    received += 1;
                }
                Ok(Err(error)) => return Err(TransportError::Poll(error.to_string())),
                Err(_) => break,
            }
        }

        self.track_assignment()?;
        let batches = ConsumerEvent::Batches(
            grouped
                .into_iter()
                .map(|(partition, messages)| MessageBatch { partition, messages })
                .collect(),
        );
        // Rebalance notices observed alongside a batch are delivered on the next polls.
        Ok(batches)
    }

    /// Blocks a pool thread until the group coordinator acknowledges the offset.
    async fn commit(&self, partition: &TopicPartition, offset: i64) -> Result<(), TransportError> {
        let offsets = commit_list(partition, offset)?;
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|error| TransportError::Commit(format!("commit task failed: {error}")))?
            .map_err(|error| TransportError::Commit(error.to_string()))
    }

    /// librdkafka keeps group membership alive from its own background thread.
    async fn heartbeat(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::Offset;
    use triage_core::ingestion::TopicPartition;

    use super::commit_list;

    #[test]
    fn commit_lists_carry_exactly_the_next_offset_to_read() {
        let offsets = commit_list(&TopicPartition::new("ITEM_SUBMISSION_EVENTS", 7), 42)
            .expect("commit list");

        let elements = offsets.elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].topic(), "ITEM_SUBMISSION_EVENTS");
        assert_eq!(elements[0].partition(), 7);
        assert_eq!(elements[0].offset(), Offset::Offset(42));
    }
}
