use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use triage_core::decisioning::DecisionLog;
use triage_core::domain::decision::Decision;
use triage_core::domain::item::OrgId;
use triage_core::domain::job::{JobId, QueueId};
use triage_core::errors::StoreError;

use super::{db, decode, from_json, parse_timestamp, timestamp, to_json};
use crate::DbPool;

pub struct SqlDecisionLog {
    pool: DbPool,
}

impl SqlDecisionLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_decision(row: &SqliteRow) -> Result<Decision, StoreError> {
    let components: String = row.try_get("components_json").map_err(decode)?;
    let related_actions: String = row.try_get("related_actions_json").map_err(decode)?;
    let job_payload: String = row.try_get("job_payload_json").map_err(decode)?;
    let created_at: String = row.try_get("created_at").map_err(decode)?;

    Ok(Decision {
        id: JobId(row.try_get("id").map_err(decode)?),
        org_id: OrgId(row.try_get("org_id").map_err(decode)?),
        queue_id: QueueId(row.try_get("queue_id").map_err(decode)?),
        reviewer_id: row.try_get("reviewer_id").map_err(decode)?,
        components: from_json(&components)?,
        related_actions: from_json(&related_actions)?,
        job_payload: from_json(&job_payload)?,
        reason: row.try_get("reason").map_err(decode)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait]
impl DecisionLog for SqlDecisionLog {
    async fn log_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO decisions (id, org_id, queue_id, reviewer_id, components_json,
                                    related_actions_json, job_payload_json, reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.id.0)
        .bind(&decision.org_id.0)
        .bind(&decision.queue_id.0)
        .bind(&decision.reviewer_id)
        .bind(to_json(&decision.components)?)
        .bind(to_json(&decision.related_actions)?)
        .bind(to_json(&decision.job_payload)?)
        .bind(&decision.reason)
        .bind(timestamp(&decision.created_at))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get_decision(&self, org_id: &OrgId, id: &JobId) -> Result<Option<Decision>, StoreError> {
        let row = sqlx::query(
            "SELECT id, org_id, queue_id, reviewer_id, components_json, related_actions_json,
                    job_payload_json, reason, created_at
             FROM decisions WHERE org_id = ? AND id = ?",
        )
        .bind(&org_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(row_to_decision).transpose()
    }
}
