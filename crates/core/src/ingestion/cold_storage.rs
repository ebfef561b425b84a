//! Accumulates warehouse events per partition and uploads fixed-size compressed batches.
//!
//! Pending messages are keyed by offset, so a redelivered batch never duplicates rows. The
//! object key is derived from the first pending record and the partition, and batches are
//! only flushed once `batch_size` is reached, so replaying from the last committed offset
//! rewrites the same bytes to the same key.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::errors::StoreError;
use crate::ingestion::object_store::ObjectStore;
use crate::ingestion::{
    BatchHandler, DeadLetter, DeadLetterSink, IngestionError, LogMessage, MessageBatch,
    TopicPartition,
};

#[derive(Debug, Error)]
pub enum ColdStorageError {
    #[error("batch compression failed: {0}")]
    Compress(String),
    #[error("batch upload failed: {0}")]
    Upload(#[source] StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColdStorageSettings {
    pub batch_size: usize,
    pub path_prefix: String,
    pub compression_level: i32,
}

impl Default for ColdStorageSettings {
    fn default() -> Self {
        Self {
            batch_size: 30_000,
            path_prefix: "api/INGESTED_JSON".to_owned(),
            compression_level: 6,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
struct WarehouseRecord {
    table: String,
    #[serde(alias = "dataJSON")]
    data_json: String,
    #[serde(alias = "recordedAt")]
    recorded_at: DateTime<Utc>,
}

type PendingRecords = BTreeMap<i64, WarehouseRecord>;

pub struct ColdStorageBatcher {
    store: Arc<dyn ObjectStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    settings: ColdStorageSettings,
    pending: Mutex<HashMap<TopicPartition, PendingRecords>>,
}

impl ColdStorageBatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        settings: ColdStorageSettings,
    ) -> Self {
        Self { store, dead_letters, settings, pending: Mutex::new(HashMap::new()) }
    }

    /// Number of records waiting for a partition's next upload.
    pub fn pending_len(&self, partition: &TopicPartition) -> usize {
        self.with_pending(|pending| pending.get(partition).map_or(0, BTreeMap::len))
    }

    fn with_pending<R>(&self, f: impl FnOnce(&mut HashMap<TopicPartition, PendingRecords>) -> R) -> R {
        match self.pending.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    async fn decode(
        &self,
        partition: &TopicPartition,
        message: &LogMessage,
    ) -> Result<Option<WarehouseRecord>, IngestionError> {
        let reason = match serde_json::from_slice::<WarehouseRecord>(&message.payload) {
            Ok(record) => match serde_json::from_str::<serde_json::Value>(&record.data_json) {
                Ok(_) => return Ok(Some(record)),
                Err(error) => format!("data_json is not valid json: {error}"),
            },
            Err(error) => format!("undecodable warehouse record: {error}"),
        };

        warn!(
            event_name = "cold_storage.message.dead_lettered",
            topic = %partition.topic,
            partition = partition.partition,
            offset = message.offset,
            reason = %reason,
            "diverting message to dead letters"
        );
        self.dead_letters
            .write(DeadLetter::new(partition, message, reason))
            .await
            .map_err(IngestionError::DeadLetter)?;
        Ok(None)
    }

    async fn upload(
        &self,
        partition: &TopicPartition,
        records: Vec<WarehouseRecord>,
    ) -> Result<(), ColdStorageError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let key = object_key(&self.settings.path_prefix, first.recorded_at, partition);
        let rows = records.len();
        let body = render_lines(&records);
        let level = self.settings.compression_level;
        let compressed = tokio::task::spawn_blocking(move || zstd::stream::encode_all(&body[..], level))
            .await
            .map_err(|error| ColdStorageError::Compress(error.to_string()))?
            .map_err(|error| ColdStorageError::Compress(error.to_string()))?;

        self.store.put(&key, compressed).await.map_err(ColdStorageError::Upload)?;
        info!(
            event_name = "cold_storage.batch.uploaded",
            topic = %partition.topic,
            partition = partition.partition,
            rows,
            key = %key,
            "batch uploaded"
        );
        Ok(())
    }
}

#[async_trait]
impl BatchHandler for ColdStorageBatcher {
    async fn handle_batch(&self, batch: &MessageBatch) -> Result<Option<i64>, IngestionError> {
        let Some(last_offset) = batch.last_offset() else {
            return Ok(None);
        };

        let mut decoded = Vec::with_capacity(batch.messages.len());
        for message in &batch.messages {
            if let Some(record) = self.decode(&batch.partition, message).await? {
                decoded.push((message.offset, record));
            }
        }

        let ready = self.with_pending(|pending| {
            let records = pending.entry(batch.partition.clone()).or_default();
            records.extend(decoded);
            (records.len() >= self.settings.batch_size)
                .then(|| records.values().cloned().collect::<Vec<_>>())
        });

        match ready {
            Some(records) => {
                self.upload(&batch.partition, records).await?;
                Ok(Some(last_offset + 1))
            }
            None => Ok(None),
        }
    }

    async fn on_committed(&self, partition: &TopicPartition, offset: i64) {
        self.with_pending(|pending| {
            if let Some(records) = pending.get_mut(partition) {
                records.retain(|pending_offset, _| *pending_offset >= offset);
                if records.is_empty() {
                    pending.remove(partition);
                }
            }
        });
    }

    async fn on_assigned(&self, partitions: &[TopicPartition]) {
        let dropped = self.with_pending(|pending| {
            let before = pending.len();
            pending.retain(|partition, _| partitions.contains(partition));
            before - pending.len()
        });
        if dropped > 0 {
            info!(
                event_name = "cold_storage.pending.discarded",
                partitions = dropped,
                "discarded pending records for partitions no longer owned"
            );
        }
    }

    async fn on_revoked(&self, partitions: &[TopicPartition]) {
        self.with_pending(|pending| {
            for partition in partitions {
                pending.remove(partition);
            }
        });
    }
}

/// `{prefix}/{yyyy}/{MM}/{dd}/{HH}/{m}/{yyyy}-{MM}-{dd}T{HH}{mm}{ss}{SSS}{partition}.json.zst`,
/// where `m` is the tens digit of the minute and `partition` is the base64url encoding of
/// `["topic",partition]`.
pub fn object_key(prefix: &str, first_recorded_at: DateTime<Utc>, partition: &TopicPartition) -> String {
    let minute = first_recorded_at.format("%M").to_string();
    let minute_bucket = &minute[..1];
    let partition_id = serde_json::json!([partition.topic, partition.partition]).to_string();
    let file = format!(
        "{}{}.json.zst",
        first_recorded_at.format("%Y-%m-%dT%H%M%S%3f"),
        URL_SAFE_NO_PAD.encode(partition_id),
    );
    let folders = format!("{}/{minute_bucket}", first_recorded_at.format("%Y/%m/%d/%H"));

    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("{folders}/{file}")
    } else {
        format!("{prefix}/{folders}/{file}")
    }
}

fn render_lines(records: &[WarehouseRecord]) -> Vec<u8> {
    let mut body = Vec::new();
    for record in records {
        let table = serde_json::Value::String(record.table.clone());
        body.extend_from_slice(format!("{{\"table\":{table},\"data\":{}}}\n", record.data_json).as_bytes());
    }
    body
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{object_key, ColdStorageBatcher, ColdStorageSettings};
    use crate::ingestion::{BatchHandler, LogMessage, MessageBatch, TopicPartition};
    use crate::memory::{InMemoryDeadLetters, InMemoryObjectStore};

    fn partition() -> TopicPartition {
        TopicPartition::new("DATA_WAREHOUSE_INGEST_EVENTS", 3)
    }

    fn message(offset: i64) -> LogMessage {
        let value = json!({
            "table": "ACTION_EXECUTIONS",
            "data_json": format!("{{\"n\":{offset}}}"),
            "recorded_at": format!("2026-03-04T10:27:05.{:03}Z", 42 + offset),
        });
        LogMessage { offset, key: None, payload: value.to_string().into_bytes(), timestamp: None }
    }

    fn batch(offsets: std::ops::Range<i64>) -> MessageBatch {
        MessageBatch { partition: partition(), messages: offsets.map(message).collect() }
    }

    fn batcher(store: &InMemoryObjectStore, letters: &InMemoryDeadLetters) -> ColdStorageBatcher {
        ColdStorageBatcher::new(
            Arc::new(store.clone()),
            Arc::new(letters.clone()),
            ColdStorageSettings { batch_size: 4, ..ColdStorageSettings::default() },
        )
    }

    fn decompress(bytes: &[u8]) -> String {
        String::from_utf8(zstd::stream::decode_all(bytes).expect("zstd")).expect("utf8")
    }

    #[test]
    fn object_keys_bucket_by_ten_minutes_and_encode_the_partition() {
        let recorded_at = Utc
            .with_ymd_and_hms(2026, 3, 4, 10, 27, 5)
            .single()
            .expect("timestamp")
            + chrono::Duration::milliseconds(42);

        assert_eq!(
            object_key("api/INGESTED_JSON/", recorded_at, &partition()),
            "api/INGESTED_JSON/2026/03/04/10/2/2026-03-04T102705042\
             WyJEQVRBX1dBUkVIT1VTRV9JTkdFU1RfRVZFTlRTIiwzXQ.json.zst"
        );
    }

    #[tokio::test]
    async fn flushes_once_the_threshold_is_reached_and_clears_after_commit() {
        let store = InMemoryObjectStore::default();
        let letters = InMemoryDeadLetters::default();
        let batcher = batcher(&store, &letters);

        assert_eq!(batcher.handle_batch(&batch(0..2)).await.expect("first"), None);
        assert!(store.objects().is_empty());

        let commit = batcher.handle_batch(&batch(2..5)).await.expect("second");
        assert_eq!(commit, Some(5));
        let objects = store.objects();
        assert_eq!(objects.len(), 1);
        let lines = decompress(objects.values().next().expect("object"));
        assert_eq!(lines.lines().count(), 5);
        assert_eq!(lines.lines().next(), Some(r#"{"table":"ACTION_EXECUTIONS","data":{"n":0}}"#));

        assert_eq!(batcher.pending_len(&partition()), 5);
        batcher.on_committed(&partition(), 5).await;
        assert_eq!(batcher.pending_len(&partition()), 0);
    }

    #[tokio::test]
    async fn redelivered_messages_are_deduplicated_by_offset() {
        let store = InMemoryObjectStore::default();
        let letters = InMemoryDeadLetters::default();
        let batcher = batcher(&store, &letters);

        batcher.handle_batch(&batch(0..3)).await.expect("first delivery");
        let outcome = batcher.handle_batch(&batch(0..3)).await.expect("redelivery");

        assert_eq!(outcome, None);
        assert_eq!(batcher.pending_len(&partition()), 3);
    }

    #[tokio::test]
    async fn replay_after_a_crash_rewrites_the_same_object() {
        let store = InMemoryObjectStore::default();
        let letters = InMemoryDeadLetters::default();

        let crashed = batcher(&store, &letters);
        crashed.handle_batch(&batch(0..2)).await.expect("first");
        crashed.handle_batch(&batch(2..4)).await.expect("upload before crash");
        let before = store.objects();

        let restarted = batcher(&store, &letters);
        restarted.handle_batch(&batch(0..2)).await.expect("replay first");
        restarted.handle_batch(&batch(2..4)).await.expect("replay upload");

        assert_eq!(store.objects(), before);
        assert_eq!(before.len(), 1);
    }

    #[tokio::test]
    async fn reassignment_discards_pending_records_without_flushing() {
        let store = InMemoryObjectStore::default();
        let letters = InMemoryDeadLetters::default();
        let batcher = batcher(&store, &letters);
        batcher.handle_batch(&batch(0..3)).await.expect("pending");

        batcher.on_assigned(&[TopicPartition::new("DATA_WAREHOUSE_INGEST_EVENTS", 7)]).await;

        assert_eq!(batcher.pending_len(&partition()), 0);
        assert!(store.objects().is_empty());
    }

    #[tokio::test]
    async fn undecodable_values_are_dead_lettered_and_still_committed() {
        let store = InMemoryObjectStore::default();
        let letters = InMemoryDeadLetters::default();
        let batcher = batcher(&store, &letters);
        let mut messages: Vec<LogMessage> = (0..4).map(message).collect();
        messages.push(LogMessage { offset: 4, key: None, payload: b"not json".to_vec(), timestamp: None });

        let commit = batcher
            .handle_batch(&MessageBatch { partition: partition(), messages })
            .await
            .expect("batch");

        assert_eq!(commit, Some(5));
        assert_eq!(letters.letters().len(), 1);
        assert_eq!(letters.letters()[0].offset, 4);
    }

    #[tokio::test]
    async fn upload_failures_keep_records_pending() {
        let store = InMemoryObjectStore::default();
        let letters = InMemoryDeadLetters::default();
        let batcher = batcher(&store, &letters);
        store.set_failing(true);

        assert!(batcher.handle_batch(&batch(0..4)).await.is_err());
        assert_eq!(batcher.pending_len(&partition()), 4);

        store.set_failing(false);
        assert_eq!(batcher.handle_batch(&batch(0..4)).await.expect("retry"), Some(4));
    }
}
