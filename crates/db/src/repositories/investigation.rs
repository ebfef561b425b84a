use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use triage_core::domain::item::{ItemIdentifier, ItemSubmission, OrgId};
use triage_core::errors::StoreError;
use triage_core::investigation::ItemInvestigation;

use super::{db, decode, from_json, timestamp, to_json};
use crate::DbPool;

/// Submissions stored as JSON alongside the columns needed to look them up.
/// An item without a created-at timestamp is ordered by its submission time.
pub struct SqlItemInvestigation {
    pool: DbPool,
}

impl SqlItemInvestigation {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode_submissions(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<ItemSubmission>, StoreError> {
    rows.iter()
        .map(|row| {
            let json: String = row.try_get("submission_json").map_err(decode)?;
            from_json(&json)
        })
        .collect()
}

#[async_trait]
impl ItemInvestigation for SqlItemInvestigation {
    async fn insert_item(&self, item: &ItemSubmission) -> Result<(), StoreError> {
        let effective_created_at = item.created_at.unwrap_or(item.submission_time);
        sqlx::query(
            "INSERT INTO investigation_items (submission_id, org_id, item_id, item_type_id,
                                              thread_id, thread_type_id, effective_created_at,
                                              submission_time, submission_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(submission_id) DO NOTHING",
        )
        .bind(&item.submission_id)
        .bind(&item.org_id.0)
        .bind(&item.item.id)
        .bind(&item.item.type_id.0)
        .bind(item.thread.as_ref().map(|thread| thread.id.as_str()))
        .bind(item.thread.as_ref().map(|thread| thread.type_id.0.as_str()))
        .bind(timestamp(&effective_created_at))
        .bind(timestamp(&item.submission_time))
        .bind(to_json(item)?)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn get_item(
        &self,
        org_id: &OrgId,
        item: &ItemIdentifier,
    ) -> Result<Option<ItemSubmission>, StoreError> {
        let row = sqlx::query(
            "SELECT submission_json FROM investigation_items
             WHERE org_id = ? AND item_type_id = ? AND item_id = ?
             ORDER BY submission_time DESC, rowid DESC
             LIMIT 1",
        )
        .bind(&org_id.0)
        .bind(&item.type_id.0)
        .bind(&item.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        match row {
            Some(row) => {
                let json: String = row.try_get("submission_json").map_err(decode)?;
                Ok(Some(from_json(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn get_thread_items(
        &self,
        org_id: &OrgId,
        thread: &ItemIdentifier,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ItemSubmission>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT submission_json FROM (
                 SELECT submission_json, effective_created_at, submission_time,
                        ROW_NUMBER() OVER (
                            PARTITION BY item_type_id, item_id
                            ORDER BY submission_time DESC, rowid DESC
                        ) AS latest
                 FROM investigation_items
                 WHERE org_id = ? AND thread_type_id = ? AND thread_id = ?
             )
             WHERE latest = 1 AND effective_created_at <= ?
             ORDER BY effective_created_at DESC, submission_time DESC
             LIMIT ?",
        )
        .bind(&org_id.0)
        .bind(&thread.type_id.0)
        .bind(&thread.id)
        .bind(timestamp(&before))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        decode_submissions(rows)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use triage_core::domain::item::ItemIdentifier;
    use triage_core::investigation::ItemInvestigation;

    use super::SqlItemInvestigation;
    use crate::repositories::test_support::{org, pool, submission};

    #[tokio::test]
    async fn reinserting_a_submission_is_a_no_op_and_latest_wins() {
        let store = SqlItemInvestigation::new(pool().await);
        let first = submission("s-1", "i-1", 1);
        let mut second = submission("s-2", "i-1", 2);
        second.data.insert("text".to_string(), "edited".into());

        store.insert_item(&first).await.expect("insert");
        store.insert_item(&first).await.expect("reinsert");
        store.insert_item(&second).await.expect("insert newer");

        let latest = store
            .get_item(&org(), &ItemIdentifier::new("i-1", "post"))
            .await
            .expect("load")
            .expect("present");
        assert_eq!(latest.submission_id, "s-2");
    }

    #[tokio::test]
    async fn thread_items_are_latest_per_item_newest_first_and_bounded() {
        let store = SqlItemInvestigation::new(pool().await);
        let thread = ItemIdentifier::new("t-1", "thread");
        for (submission_id, item_id, minute) in
            [("s-1", "i-1", 1), ("s-2", "i-2", 2), ("s-3", "i-1", 3), ("s-4", "i-3", 9)]
        {
            let mut item = submission(submission_id, item_id, minute);
            item.thread = Some(thread.clone());
            if item_id == "i-1" {
                item.created_at = Some(Utc.with_ymd_and_hms(2026, 3, 4, 10, 1, 0).single().expect("time"));
            }
            store.insert_item(&item).await.expect("insert");
        }

        let before = Utc.with_ymd_and_hms(2026, 3, 4, 10, 5, 0).single().expect("time");
        let items = store.get_thread_items(&org(), &thread, before, 10).await.expect("thread");
        let ids: Vec<&str> = items.iter().map(|item| item.submission_id.as_str()).collect();
        assert_eq!(ids, vec!["s-2", "s-3"]);

        let bounded = store.get_thread_items(&org(), &thread, before, 1).await.expect("thread");
        assert_eq!(bounded.len(), 1);
    }
}
