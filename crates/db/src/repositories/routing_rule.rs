use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use triage_core::domain::condition::ConditionSet;
use triage_core::domain::item::{ItemTypeId, OrgId};
use triage_core::domain::job::QueueId;
use triage_core::domain::routing::{
    RoutingRule, RoutingRuleId, RoutingRuleStatus, RoutingRuleVersion, SequenceChange,
};
use triage_core::errors::StoreError;
use triage_core::routing::rules::RoutingRuleStore;

use super::{db, decode, from_json, parse_timestamp, timestamp, to_json};
use crate::DbPool;

const RULE_COLUMNS: &str = "r.id, r.org_id, r.name, r.description, r.status, r.condition_set_json,
    r.destination_queue_id, r.sequence_number, r.version, r.creator_id, r.is_appeals_rule,
    (SELECT json_group_array(item_type_id) FROM (
        SELECT item_type_id FROM routing_rules_to_item_types
        WHERE routing_rule_id = r.id ORDER BY position
    )) AS item_type_ids_json";

pub struct SqlRoutingRuleStore {
    pool: DbPool,
}

impl SqlRoutingRuleStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_rule(row: &SqliteRow) -> Result<RoutingRule, StoreError> {
    let status: String = row.try_get("status").map_err(decode)?;
    let condition_set: String = row.try_get("condition_set_json").map_err(decode)?;
    let item_type_ids: String = row.try_get("item_type_ids_json").map_err(decode)?;
    let version: String = row.try_get("version").map_err(decode)?;

    Ok(RoutingRule {
        id: RoutingRuleId(row.try_get("id").map_err(decode)?),
        org_id: OrgId(row.try_get("org_id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
        status: RoutingRuleStatus::parse(&status)
            .ok_or_else(|| decode(format!("unknown routing rule status `{status}`")))?,
        condition_set: from_json::<ConditionSet>(&condition_set)?,
        destination_queue_id: QueueId(row.try_get("destination_queue_id").map_err(decode)?),
        item_type_ids: from_json::<Vec<String>>(&item_type_ids)?
            .into_iter()
            .map(ItemTypeId)
            .collect(),
        sequence_number: row.try_get("sequence_number").map_err(decode)?,
        version: parse_timestamp(&version)?,
        creator_id: row.try_get("creator_id").map_err(decode)?,
        is_appeals_rule: row.try_get("is_appeals_rule").map_err(decode)?,
    })
}

fn row_to_version(row: &SqliteRow) -> Result<RoutingRuleVersion, StoreError> {
    let version: String = row.try_get("version").map_err(decode)?;
    let condition_set: String = row.try_get("condition_set_json").map_err(decode)?;
    let item_type_ids: String = row.try_get("item_type_ids_json").map_err(decode)?;

    Ok(RoutingRuleVersion {
        rule_id: RoutingRuleId(row.try_get("routing_rule_id").map_err(decode)?),
        version: parse_timestamp(&version)?,
        name: row.try_get("name").map_err(decode)?,
        condition_set: from_json(&condition_set)?,
        destination_queue_id: QueueId(row.try_get("destination_queue_id").map_err(decode)?),
        item_type_ids: from_json(&item_type_ids)?,
        is_current: row.try_get("is_current").map_err(decode)?,
    })
}

async fn replace_item_types(
    conn: &mut SqliteConnection,
    rule: &RoutingRule,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM routing_rules_to_item_types WHERE routing_rule_id = ?")
        .bind(&rule.id.0)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    for (position, item_type_id) in rule.item_type_ids.iter().enumerate() {
        sqlx::query(
            "INSERT INTO routing_rules_to_item_types (routing_rule_id, item_type_id, position)
             VALUES (?, ?, ?)",
        )
        .bind(&rule.id.0)
        .bind(&item_type_id.0)
        .bind(position as i64)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    }
    Ok(())
}

async fn append_version(conn: &mut SqliteConnection, rule: &RoutingRule) -> Result<(), StoreError> {
    let version = RoutingRuleVersion::of(rule);
    sqlx::query(
        "INSERT INTO routing_rule_versions (routing_rule_id, version, name, condition_set_json,
                                            destination_queue_id, item_type_ids_json, is_current)
         VALUES (?, ?, ?, ?, ?, ?, 1)",
    )
    .bind(&version.rule_id.0)
    .bind(timestamp(&version.version))
    .bind(&version.name)
    .bind(to_json(&version.condition_set)?)
    .bind(&version.destination_queue_id.0)
    .bind(to_json(&version.item_type_ids)?)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

#[async_trait]
impl RoutingRuleStore for SqlRoutingRuleStore {
    async fn list_current_rules(&self, org_id: &OrgId) -> Result<Vec<RoutingRule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM routing_rules r
             WHERE r.org_id = ? ORDER BY r.sequence_number ASC"
        ))
        .bind(&org_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(row_to_rule).collect()
    }

    async fn find_rule(
        &self,
        org_id: &OrgId,
        id: &RoutingRuleId,
    ) -> Result<Option<RoutingRule>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM routing_rules r WHERE r.org_id = ? AND r.id = ?"
        ))
        .bind(&org_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        row.as_ref().map(row_to_rule).transpose()
    }

    async fn next_sequence_number(&self, org_id: &OrgId) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence_number), 0) + 1 AS next FROM routing_rules WHERE org_id = ?",
        )
        .bind(&org_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        row.try_get("next").map_err(decode)
    }

    async fn insert_rule(&self, rule: &RoutingRule) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query(
            "INSERT INTO routing_rules (id, org_id, name, description, status, condition_set_json,
                                        destination_queue_id, sequence_number, version,
                                        creator_id, is_appeals_rule)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.id.0)
        .bind(&rule.org_id.0)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.status.as_str())
        .bind(to_json(&rule.condition_set)?)
        .bind(&rule.destination_queue_id.0)
        .bind(rule.sequence_number)
        .bind(timestamp(&rule.version))
        .bind(&rule.creator_id)
        .bind(rule.is_appeals_rule)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        replace_item_types(&mut tx, rule).await?;
        append_version(&mut tx, rule).await?;
        tx.commit().await.map_err(db)
    }

    async fn update_rule(&self, rule: &RoutingRule, new_version: bool) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let updated = sqlx::query(
            "UPDATE routing_rules SET
                 name = ?, description = ?, status = ?, condition_set_json = ?,
                 destination_queue_id = ?, sequence_number = ?, version = ?,
                 creator_id = ?, is_appeals_rule = ?
             WHERE org_id = ? AND id = ?",
        )
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.status.as_str())
        .bind(to_json(&rule.condition_set)?)
        .bind(&rule.destination_queue_id.0)
        .bind(rule.sequence_number)
        .bind(timestamp(&rule.version))
        .bind(&rule.creator_id)
        .bind(rule.is_appeals_rule)
        .bind(&rule.org_id.0)
        .bind(&rule.id.0)
        .execute(&mut *tx)
        .await
        .map_err(db)?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("routing rule {}", rule.id.0)));
        }

        replace_item_types(&mut tx, rule).await?;
        if new_version {
            sqlx::query("UPDATE routing_rule_versions SET is_current = 0 WHERE routing_rule_id = ?")
                .bind(&rule.id.0)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
            append_version(&mut tx, rule).await?;
        }
        tx.commit().await.map_err(db)
    }

    async fn delete_rule(&self, org_id: &OrgId, id: &RoutingRuleId) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM routing_rules WHERE org_id = ? AND id = ?")
            .bind(&org_id.0)
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(db)?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn apply_sequence_changes(
        &self,
        org_id: &OrgId,
        changes: &[SequenceChange],
    ) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE routing_rules SET sequence_number = CASE id");
        for change in changes {
            query.push(" WHEN ").push_bind(&change.rule_id.0);
            query.push(" THEN ").push_bind(change.to);
        }
        query.push(" ELSE sequence_number END WHERE org_id = ").push_bind(&org_id.0);
        query.push(" AND id IN (");
        let mut ids = query.separated(", ");
        for change in changes {
            ids.push_bind(&change.rule_id.0);
        }
        query.push(")");

        query.build().execute(&self.pool).await.map_err(db)?;
        Ok(())
    }

    async fn list_versions(
        &self,
        org_id: &OrgId,
        id: &RoutingRuleId,
    ) -> Result<Vec<RoutingRuleVersion>, StoreError> {
        let rows = sqlx::query(
            "SELECT v.routing_rule_id, v.version, v.name, v.condition_set_json,
                    v.destination_queue_id, v.item_type_ids_json, v.is_current
             FROM routing_rule_versions v
             JOIN routing_rules r ON r.id = v.routing_rule_id
             WHERE r.org_id = ? AND v.routing_rule_id = ?
             ORDER BY v.version DESC",
        )
        .bind(&org_id.0)
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter().map(row_to_version).collect()
    }
}
