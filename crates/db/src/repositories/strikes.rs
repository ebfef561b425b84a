use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use triage_core::actions::strikes::{StrikeStore, StrikeThreshold};
use triage_core::domain::action::{ActionId, PolicyId};
use triage_core::domain::item::{ItemIdentifier, OrgId};
use triage_core::errors::StoreError;

use super::{db, decode, from_json, timestamp, to_json};
use crate::DbPool;

/// Strikes are an append-only ledger; a user's total is the sum of their rows.
pub struct SqlStrikeStore {
    pool: DbPool,
}

impl SqlStrikeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn save_threshold(&self, threshold: &StrikeThreshold) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO strike_thresholds (org_id, threshold, action_ids_json) VALUES (?, ?, ?)
             ON CONFLICT(org_id, threshold) DO UPDATE SET action_ids_json = excluded.action_ids_json",
        )
        .bind(&threshold.org_id.0)
        .bind(i64::from(threshold.threshold))
        .bind(to_json(&threshold.action_ids)?)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }
}

#[async_trait]
impl StrikeStore for SqlStrikeStore {
    async fn record_strikes(
        &self,
        org_id: &OrgId,
        user: &ItemIdentifier,
        policy_id: &PolicyId,
        count: u32,
    ) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query(
            "INSERT INTO user_strikes (org_id, user_id, user_type_id, policy_id, strike_count, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&org_id.0)
        .bind(&user.id)
        .bind(&user.type_id.0)
        .bind(&policy_id.0)
        .bind(i64::from(count))
        .bind(timestamp(&Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(strike_count), 0) FROM user_strikes
             WHERE org_id = ? AND user_type_id = ? AND user_id = ?",
        )
        .bind(&org_id.0)
        .bind(&user.type_id.0)
        .bind(&user.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;
        tx.commit().await.map_err(db)?;

        u32::try_from(total).map_err(decode)
    }

    async fn get_thresholds(&self, org_id: &OrgId) -> Result<Vec<StrikeThreshold>, StoreError> {
        let rows = sqlx::query(
            "SELECT org_id, threshold, action_ids_json FROM strike_thresholds
             WHERE org_id = ? ORDER BY threshold ASC",
        )
        .bind(&org_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter()
            .map(|row| {
                let threshold: i64 = row.try_get("threshold").map_err(decode)?;
                let action_ids: String = row.try_get("action_ids_json").map_err(decode)?;
                Ok(StrikeThreshold {
                    org_id: OrgId(row.try_get("org_id").map_err(decode)?),
                    threshold: u32::try_from(threshold).map_err(decode)?,
                    action_ids: from_json::<Vec<ActionId>>(&action_ids)?,
                })
            })
            .collect()
    }
}
