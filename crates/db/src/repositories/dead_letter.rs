use async_trait::async_trait;
use tracing::{debug, warn};

use triage_core::errors::StoreError;
use triage_core::ingestion::{DeadLetter, DeadLetterSink};

use super::{db, timestamp};
use crate::DbPool;

pub struct SqlDeadLetterSink {
    pool: DbPool,
}

impl SqlDeadLetterSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn count(&self, topic: &str) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await
            .map_err(db)
    }
}

#[async_trait]
impl DeadLetterSink for SqlDeadLetterSink {
    /// A replayed batch re-delivers the same offsets; the first letter for an offset is kept.
    async fn write(&self, letter: DeadLetter) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO dead_letters (topic, partition_id, message_offset, payload, reason, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(topic, partition_id, message_offset) DO NOTHING",
        )
        .bind(&letter.topic)
        .bind(letter.partition)
        .bind(letter.offset)
        .bind(&letter.payload)
        .bind(&letter.reason)
        .bind(timestamp(&letter.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();

        if inserted == 0 {
            debug!(
                event_name = "ingestion.dead_letter.duplicate",
                topic = %letter.topic,
                partition = letter.partition,
                offset = letter.offset,
                "message already dead-lettered"
            );
            return Ok(());
        }

        warn!(
            event_name = "ingestion.dead_letter.recorded",
            topic = %letter.topic,
            partition = letter.partition,
            offset = letter.offset,
            reason = %letter.reason,
            "message dead-lettered"
        );
        Ok(())
    }
}
