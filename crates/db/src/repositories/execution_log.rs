use async_trait::async_trait;

use triage_core::audit::{
    ActionExecutionLogger, RoutingExecutionLogger, RuleExecutionLogger, SubmissionLog,
    SubmissionLogger,
};
use triage_core::domain::action::ActionExecution;
use triage_core::domain::routing::RoutingRuleExecution;
use triage_core::domain::rule::RuleExecution;
use triage_core::errors::StoreError;

use super::{db, timestamp, to_json};
use crate::DbPool;

/// Append-only execution history. Every batch is written in one transaction.
pub struct SqlExecutionLog {
    pool: DbPool,
}

impl SqlExecutionLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoutingExecutionLogger for SqlExecutionLog {
    async fn log_routing_rule_executions(
        &self,
        executions: Vec<RoutingRuleExecution>,
    ) -> Result<(), StoreError> {
        if executions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db)?;
        for execution in &executions {
            sqlx::query(
                "INSERT INTO routing_rule_executions (org_id, routing_rule_id, rule_version, rule_name,
                                                      destination_queue_id, item_id, item_type_id, status,
                                                      trace_json, policy_ids_json, correlation_id, occurred_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&execution.org_id.0)
            .bind(&execution.rule_id.0)
            .bind(timestamp(&execution.rule_version))
            .bind(&execution.rule_name)
            .bind(&execution.destination_queue_id.0)
            .bind(&execution.item_id)
            .bind(&execution.item_type_id.0)
            .bind(execution.status.as_str())
            .bind(to_json(&execution.trace)?)
            .bind(to_json(&execution.policy_ids)?)
            .bind(&execution.correlation_id)
            .bind(timestamp(&execution.occurred_at))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)
    }
}

#[async_trait]
impl RuleExecutionLogger for SqlExecutionLog {
    async fn log_rule_executions(&self, executions: Vec<RuleExecution>) -> Result<(), StoreError> {
        if executions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db)?;
        for execution in &executions {
            sqlx::query(
                "INSERT INTO rule_executions (org_id, rule_id, rule_name, rule_version, environment,
                                              item_id, item_type_id, passed, trace_json,
                                              correlation_id, occurred_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&execution.org_id.0)
            .bind(&execution.rule_id.0)
            .bind(&execution.rule_name)
            .bind(timestamp(&execution.rule_version))
            .bind(execution.environment.as_str())
            .bind(&execution.item.id)
            .bind(&execution.item.type_id.0)
            .bind(execution.passed)
            .bind(to_json(&execution.trace)?)
            .bind(&execution.correlation_id)
            .bind(timestamp(&execution.occurred_at))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)
    }
}

#[async_trait]
impl ActionExecutionLogger for SqlExecutionLog {
    async fn log_action_executions(
        &self,
        executions: Vec<ActionExecution>,
    ) -> Result<(), StoreError> {
        if executions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db)?;
        for execution in &executions {
            sqlx::query(
                "INSERT INTO action_executions (org_id, action_id, action_name, item_id, item_type_id,
                                                policy_ids_json, matching_rule_ids_json, rule_environment,
                                                correlation_id, actor_id, job_id, success,
                                                started_at, finished_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&execution.org_id.0)
            .bind(&execution.action_id.0)
            .bind(&execution.action_name)
            .bind(&execution.target.id)
            .bind(&execution.target.type_id.0)
            .bind(to_json(&execution.policy_ids)?)
            .bind(to_json(&execution.matching_rule_ids)?)
            .bind(execution.rule_environment.map(|environment| environment.as_str()))
            .bind(&execution.correlation_id)
            .bind(&execution.actor_id)
            .bind(execution.job_id.as_ref().map(|job_id| job_id.0.as_str()))
            .bind(execution.success)
            .bind(timestamp(&execution.started_at))
            .bind(timestamp(&execution.finished_at))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        tx.commit().await.map_err(db)
    }
}

#[async_trait]
impl SubmissionLogger for SqlExecutionLog {
    async fn log_submission(&self, entry: SubmissionLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO submission_logs (org_id, request_id, submission_id, item_id, item_type_id,
                                          rules_evaluated, actions_published, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.org_id.0)
        .bind(&entry.request_id)
        .bind(&entry.submission_id)
        .bind(&entry.item.id)
        .bind(&entry.item.type_id.0)
        .bind(i64::try_from(entry.rules_evaluated).unwrap_or(i64::MAX))
        .bind(i64::try_from(entry.actions_published).unwrap_or(i64::MAX))
        .bind(timestamp(&entry.occurred_at))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }
}
