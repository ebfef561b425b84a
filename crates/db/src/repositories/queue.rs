use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use triage_core::domain::item::OrgId;
use triage_core::domain::job::{Job, JobId, JobPayload, QueueId};
use triage_core::errors::StoreError;
use triage_core::queue::QueueStore;

use super::{db, decode, from_json, parse_timestamp, timestamp, to_json};
use crate::DbPool;

pub struct SqlQueueStore {
    pool: DbPool,
}

impl SqlQueueStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Creates the queue, or renames it and updates its default flag if it exists.
    /// Marking a queue as default clears the flag on the org's other queues.
    pub async fn save_queue(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
        name: &str,
        is_default: bool,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        if is_default {
            sqlx::query("UPDATE queues SET is_default = 0 WHERE org_id = ? AND id != ?")
                .bind(&org_id.0)
                .bind(&queue_id.0)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }
        sqlx::query(
            "INSERT INTO queues (org_id, id, name, is_default, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(org_id, id) DO UPDATE SET
                 name = excluded.name,
                 is_default = excluded.is_default",
        )
        .bind(&org_id.0)
        .bind(&queue_id.0)
        .bind(name)
        .bind(is_default)
        .bind(timestamp(&Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let id: String = row.try_get("id").map_err(decode)?;
    let org_id: String = row.try_get("org_id").map_err(decode)?;
    let queue_id: String = row.try_get("queue_id").map_err(decode)?;
    let payload_json: String = row.try_get("payload_json").map_err(decode)?;
    let lock_token: Option<String> = row.try_get("lock_token").map_err(decode)?;
    let created_at: String = row.try_get("created_at").map_err(decode)?;

    Ok(Job {
        id: JobId(id),
        org_id: OrgId(org_id),
        queue_id: QueueId(queue_id),
        payload: from_json::<JobPayload>(&payload_json)?,
        lock_token,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait]
impl QueueStore for SqlQueueStore {
    async fn enqueue(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
        payload: JobPayload,
    ) -> Result<Job, StoreError> {
        if !self.check_queue_exists(org_id, queue_id).await? {
            return Err(StoreError::NotFound(format!("queue {}", queue_id.0)));
        }

        let job = Job::new(org_id.clone(), queue_id.clone(), payload);
        sqlx::query(
            "INSERT INTO jobs (id, org_id, queue_id, payload_json, lock_token, created_at)
             VALUES (?, ?, ?, ?, NULL, ?)",
        )
        .bind(&job.id.0)
        .bind(&job.org_id.0)
        .bind(&job.queue_id.0)
        .bind(to_json(&job.payload)?)
        .bind(timestamp(&job.created_at))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(job)
    }

    async fn get_jobs(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
        ids: &[JobId],
    ) -> Result<Vec<Job>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = ids.iter().map(|id| id.0.as_str()).collect();
        let rows = sqlx::query(
            "SELECT id, org_id, queue_id, payload_json, lock_token, created_at
             FROM jobs
             WHERE org_id = ? AND queue_id = ? AND id IN (SELECT value FROM json_each(?))
             ORDER BY created_at ASC",
        )
        .bind(&org_id.0)
        .bind(&queue_id.0)
        .bind(to_json(&ids)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(row_to_job).collect()
    }

    async fn dequeue(&self, org_id: &OrgId, queue_id: &QueueId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            "UPDATE jobs SET lock_token = ?
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE org_id = ? AND queue_id = ? AND lock_token IS NULL
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1
             )
             RETURNING id, org_id, queue_id, payload_json, lock_token, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&org_id.0)
        .bind(&queue_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn remove_job(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
        job_id: &JobId,
        lock_token: &str,
    ) -> Result<(), StoreError> {
        let removed = sqlx::query(
            "DELETE FROM jobs WHERE org_id = ? AND queue_id = ? AND id = ? AND lock_token = ?",
        )
        .bind(&org_id.0)
        .bind(&queue_id.0)
        .bind(&job_id.0)
        .bind(lock_token)
        .execute(&self.pool)
        .await
        .map_err(db)?
        .rows_affected();
        if removed > 0 {
            return Ok(());
        }

        let held = sqlx::query("SELECT 1 FROM jobs WHERE org_id = ? AND queue_id = ? AND id = ?")
            .bind(&org_id.0)
            .bind(&queue_id.0)
            .bind(&job_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        match held {
            Some(_) => Err(StoreError::Conflict(format!("job {} is held by another lock", job_id.0))),
            None => Err(StoreError::NotFound(format!("job {}", job_id.0))),
        }
    }

    async fn check_queue_exists(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM queues WHERE org_id = ? AND id = ?")
            .bind(&org_id.0)
            .bind(&queue_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.is_some())
    }

    async fn get_default_queue_id_for_org(
        &self,
        org_id: &OrgId,
    ) -> Result<Option<QueueId>, StoreError> {
        let row = sqlx::query("SELECT id FROM queues WHERE org_id = ? AND is_default = 1")
            .bind(&org_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.map(|row| row.try_get::<String, _>("id").map(QueueId).map_err(decode)).transpose()
    }
}
