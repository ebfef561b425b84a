use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use triage_core::catalog::ModerationCatalog;
use triage_core::domain::action::{Action, ActionId, ActionKind, Policy, PolicyId};
use triage_core::domain::item::{FieldRoles, FieldSchema, ItemType, ItemTypeId, ItemTypeKind, OrgId};
use triage_core::domain::rule::{Rule, RuleId, RuleStatus};
use triage_core::errors::StoreError;

use super::{db, decode, from_json, parse_timestamp, timestamp, to_json};
use crate::DbPool;

/// Item types, rules, actions, and policies as configured per organization.
///
/// The `save_*` helpers upsert; they back the seed paths and tests since the
/// configuration surface itself lives elsewhere.
pub struct SqlModerationCatalog {
    pool: DbPool,
}

impl SqlModerationCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn save_item_type(&self, item_type: &ItemType) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO item_types (org_id, id, name, kind, version, schema_variant, fields_json, roles_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(org_id, id) DO UPDATE SET
                 name = excluded.name,
                 kind = excluded.kind,
                 version = excluded.version,
                 schema_variant = excluded.schema_variant,
                 fields_json = excluded.fields_json,
                 roles_json = excluded.roles_json",
        )
        .bind(&item_type.org_id.0)
        .bind(&item_type.id.0)
        .bind(&item_type.name)
        .bind(item_type.kind.as_str())
        .bind(&item_type.version)
        .bind(&item_type.schema_variant)
        .bind(to_json(&item_type.fields)?)
        .bind(to_json(&item_type.roles)?)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    pub async fn save_action(&self, action: &Action) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO actions (org_id, id, name, kind_json, apply_user_strikes)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(org_id, id) DO UPDATE SET
                 name = excluded.name,
                 kind_json = excluded.kind_json,
                 apply_user_strikes = excluded.apply_user_strikes",
        )
        .bind(&action.org_id.0)
        .bind(&action.id.0)
        .bind(&action.name)
        .bind(to_json(&action.kind)?)
        .bind(action.apply_user_strikes)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    pub async fn save_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO policies (org_id, id, name, penalty, user_strike_count)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(org_id, id) DO UPDATE SET
                 name = excluded.name,
                 penalty = excluded.penalty,
                 user_strike_count = excluded.user_strike_count",
        )
        .bind(&policy.org_id.0)
        .bind(&policy.id.0)
        .bind(&policy.name)
        .bind(&policy.penalty)
        .bind(i64::from(policy.user_strike_count))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    /// Upserts the rule and replaces its action and policy links. Actions and policies
    /// are expected to be saved first.
    pub async fn save_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query(
            "INSERT INTO rules (id, org_id, name, status, condition_set_json, item_type_ids_json, version)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 condition_set_json = excluded.condition_set_json,
                 item_type_ids_json = excluded.item_type_ids_json,
                 version = excluded.version",
        )
        .bind(&rule.id.0)
        .bind(&rule.org_id.0)
        .bind(&rule.name)
        .bind(rule.status.as_str())
        .bind(to_json(&rule.condition_set)?)
        .bind(to_json(&rule.item_type_ids)?)
        .bind(timestamp(&rule.version))
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        sqlx::query("DELETE FROM rule_actions WHERE rule_id = ?")
            .bind(&rule.id.0)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        for (position, action) in rule.actions.iter().enumerate() {
            sqlx::query("INSERT INTO rule_actions (rule_id, action_id, position) VALUES (?, ?, ?)")
                .bind(&rule.id.0)
                .bind(&action.id.0)
                .bind(position as i64)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        sqlx::query("DELETE FROM rule_policies WHERE rule_id = ?")
            .bind(&rule.id.0)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        for (position, policy) in rule.policies.iter().enumerate() {
            sqlx::query("INSERT INTO rule_policies (rule_id, policy_id, position) VALUES (?, ?, ?)")
                .bind(&rule.id.0)
                .bind(&policy.id.0)
                .bind(position as i64)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        tx.commit().await.map_err(db)
    }

    async fn rule_actions(&self, org_id: &OrgId, rule_id: &RuleId) -> Result<Vec<Action>, StoreError> {
        let rows = sqlx::query(
            "SELECT a.org_id, a.id, a.name, a.kind_json, a.apply_user_strikes
             FROM rule_actions ra
             JOIN actions a ON a.org_id = ? AND a.id = ra.action_id
             WHERE ra.rule_id = ?
             ORDER BY ra.position",
        )
        .bind(&org_id.0)
        .bind(&rule_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(row_to_action).collect()
    }

    async fn rule_policies(&self, org_id: &OrgId, rule_id: &RuleId) -> Result<Vec<Policy>, StoreError> {
        let rows = sqlx::query(
            "SELECT p.org_id, p.id, p.name, p.penalty, p.user_strike_count
             FROM rule_policies rp
             JOIN policies p ON p.org_id = ? AND p.id = rp.policy_id
             WHERE rp.rule_id = ?
             ORDER BY rp.position",
        )
        .bind(&org_id.0)
        .bind(&rule_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(row_to_policy).collect()
    }
}

fn row_to_item_type(row: &SqliteRow) -> Result<ItemType, StoreError> {
    let kind: String = row.try_get("kind").map_err(decode)?;
    let fields: String = row.try_get("fields_json").map_err(decode)?;
    let roles: String = row.try_get("roles_json").map_err(decode)?;

    Ok(ItemType {
        id: ItemTypeId(row.try_get("id").map_err(decode)?),
        org_id: OrgId(row.try_get("org_id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        kind: ItemTypeKind::parse(&kind)
            .ok_or_else(|| decode(format!("unknown item type kind `{kind}`")))?,
        version: row.try_get("version").map_err(decode)?,
        schema_variant: row.try_get("schema_variant").map_err(decode)?,
        fields: from_json::<Vec<FieldSchema>>(&fields)?,
        roles: from_json::<FieldRoles>(&roles)?,
    })
}

fn row_to_action(row: &SqliteRow) -> Result<Action, StoreError> {
    let kind: String = row.try_get("kind_json").map_err(decode)?;
    Ok(Action {
        id: ActionId(row.try_get("id").map_err(decode)?),
        org_id: OrgId(row.try_get("org_id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        kind: from_json::<ActionKind>(&kind)?,
        apply_user_strikes: row.try_get("apply_user_strikes").map_err(decode)?,
    })
}

fn row_to_policy(row: &SqliteRow) -> Result<Policy, StoreError> {
    let strikes: i64 = row.try_get("user_strike_count").map_err(decode)?;
    Ok(Policy {
        id: PolicyId(row.try_get("id").map_err(decode)?),
        org_id: OrgId(row.try_get("org_id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        penalty: row.try_get("penalty").map_err(decode)?,
        user_strike_count: u32::try_from(strikes).map_err(decode)?,
    })
}

#[async_trait]
impl ModerationCatalog for SqlModerationCatalog {
    async fn get_item_type(
        &self,
        org_id: &OrgId,
        item_type_id: &ItemTypeId,
    ) -> Result<Option<ItemType>, StoreError> {
        let row = sqlx::query(
            "SELECT org_id, id, name, kind, version, schema_variant, fields_json, roles_json
             FROM item_types WHERE org_id = ? AND id = ?",
        )
        .bind(&org_id.0)
        .bind(&item_type_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.as_ref().map(row_to_item_type).transpose()
    }

    async fn get_actions(&self, org_id: &OrgId, ids: &[ActionId]) -> Result<Vec<Action>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = ids.iter().map(|id| id.0.as_str()).collect();
        let rows = sqlx::query(
            "SELECT org_id, id, name, kind_json, apply_user_strikes
             FROM actions WHERE org_id = ? AND id IN (SELECT value FROM json_each(?))
             ORDER BY id",
        )
        .bind(&org_id.0)
        .bind(to_json(&ids)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(row_to_action).collect()
    }

    async fn get_policies(&self, org_id: &OrgId, ids: &[PolicyId]) -> Result<Vec<Policy>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = ids.iter().map(|id| id.0.as_str()).collect();
        let rows = sqlx::query(
            "SELECT org_id, id, name, penalty, user_strike_count
             FROM policies WHERE org_id = ? AND id IN (SELECT value FROM json_each(?))
             ORDER BY id",
        )
        .bind(&org_id.0)
        .bind(to_json(&ids)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(row_to_policy).collect()
    }

    async fn get_enabled_rules(
        &self,
        org_id: &OrgId,
        item_type_id: &ItemTypeId,
    ) -> Result<Vec<Rule>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, org_id, name, status, condition_set_json, item_type_ids_json, version
             FROM rules
             WHERE org_id = ? AND status IN ('live', 'background')
               AND EXISTS (SELECT 1 FROM json_each(rules.item_type_ids_json) WHERE value = ?)
             ORDER BY name, id",
        )
        .bind(&org_id.0)
        .bind(&item_type_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = RuleId(row.try_get("id").map_err(decode)?);
            let status: String = row.try_get("status").map_err(decode)?;
            let condition_set: String = row.try_get("condition_set_json").map_err(decode)?;
            let item_type_ids: String = row.try_get("item_type_ids_json").map_err(decode)?;
            let version: String = row.try_get("version").map_err(decode)?;

            rules.push(Rule {
                actions: self.rule_actions(org_id, &id).await?,
                policies: self.rule_policies(org_id, &id).await?,
                id,
                org_id: org_id.clone(),
                name: row.try_get("name").map_err(decode)?,
                status: RuleStatus::parse(&status)
                    .ok_or_else(|| decode(format!("unknown rule status `{status}`")))?,
                condition_set: from_json(&condition_set)?,
                item_type_ids: from_json(&item_type_ids)?,
                version: parse_timestamp(&version)?,
            });
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use triage_core::catalog::ModerationCatalog;
    use triage_core::domain::action::{Action, ActionId, ActionKind, Policy, PolicyId};
    use triage_core::domain::item::{
        FieldRoles, FieldSchema, FieldType, ItemType, ItemTypeId, ItemTypeKind,
    };
    use triage_core::domain::rule::{Rule, RuleId, RuleStatus};

    use super::SqlModerationCatalog;
    use crate::repositories::test_support::{org, pool, text_contains};

    fn action(id: &str) -> Action {
        Action {
            id: ActionId(id.to_string()),
            org_id: org(),
            name: format!("action {id}"),
            kind: ActionKind::EnqueueToReview,
            apply_user_strikes: true,
        }
    }

    fn policy(id: &str, strikes: u32) -> Policy {
        Policy {
            id: PolicyId(id.to_string()),
            org_id: org(),
            name: format!("policy {id}"),
            penalty: "medium".to_string(),
            user_strike_count: strikes,
        }
    }

    fn rule(id: &str, status: RuleStatus, item_types: &[&str]) -> Rule {
        Rule {
            id: RuleId(id.to_string()),
            org_id: org(),
            name: id.to_string(),
            status,
            condition_set: text_contains("spam"),
            item_type_ids: item_types.iter().map(|id| ItemTypeId(id.to_string())).collect(),
            actions: vec![action("a-2"), action("a-1")],
            policies: vec![policy("p-1", 2)],
            version: Utc::now(),
        }
    }

    #[tokio::test]
    async fn item_types_round_trip_with_schema_and_roles() {
        let catalog = SqlModerationCatalog::new(pool().await);
        let item_type = ItemType {
            id: ItemTypeId("post".to_string()),
            org_id: org(),
            name: "Post".to_string(),
            kind: ItemTypeKind::Content,
            version: "1".to_string(),
            schema_variant: "original".to_string(),
            fields: vec![FieldSchema {
                name: "text".to_string(),
                field_type: FieldType::String,
                required: true,
            }],
            roles: FieldRoles { creator_id: Some("author".to_string()), ..FieldRoles::default() },
        };
        catalog.save_item_type(&item_type).await.expect("save");

        let loaded = catalog.get_item_type(&org(), &item_type.id).await.expect("load");
        assert_eq!(loaded, Some(item_type));
        assert!(catalog
            .get_item_type(&org(), &ItemTypeId("missing".to_string()))
            .await
            .expect("load")
            .is_none());
    }

    #[tokio::test]
    async fn lookups_by_id_skip_unknown_ids() {
        let catalog = SqlModerationCatalog::new(pool().await);
        catalog.save_action(&action("a-1")).await.expect("action");
        catalog.save_policy(&policy("p-1", 3)).await.expect("policy");

        let actions = catalog
            .get_actions(&org(), &[ActionId("a-1".to_string()), ActionId("ghost".to_string())])
            .await
            .expect("actions");
        assert_eq!(actions, vec![action("a-1")]);

        let policies = catalog
            .get_policies(&org(), &[PolicyId("p-1".to_string())])
            .await
            .expect("policies");
        assert_eq!(policies[0].user_strike_count, 3);
    }

    #[tokio::test]
    async fn enabled_rules_filter_by_status_and_item_type() {
        let catalog = SqlModerationCatalog::new(pool().await);
        catalog.save_action(&action("a-1")).await.expect("action");
        catalog.save_action(&action("a-2")).await.expect("action");
        catalog.save_policy(&policy("p-1", 2)).await.expect("policy");
        catalog.save_rule(&rule("live", RuleStatus::Live, &["post"])).await.expect("rule");
        catalog.save_rule(&rule("shadow", RuleStatus::Background, &["post", "comment"])).await.expect("rule");
        catalog.save_rule(&rule("draft", RuleStatus::Draft, &["post"])).await.expect("rule");
        catalog.save_rule(&rule("other", RuleStatus::Live, &["comment"])).await.expect("rule");

        let rules = catalog
            .get_enabled_rules(&org(), &ItemTypeId("post".to_string()))
            .await
            .expect("rules");
        let names: Vec<&str> = rules.iter().map(|rule| rule.name.as_str()).collect();
        assert_eq!(names, vec!["live", "shadow"]);

        let action_ids: Vec<&str> = rules[0].actions.iter().map(|a| a.id.0.as_str()).collect();
        assert_eq!(action_ids, vec!["a-2", "a-1"]);
        assert_eq!(rules[0].policies, vec![policy("p-1", 2)]);
    }
}
