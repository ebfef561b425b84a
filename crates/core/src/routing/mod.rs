//! Ordered routing rules that decide which review queue an item lands in.

pub mod cache;
pub mod jobs;
pub mod rules;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::audit::RoutingExecutionLogger;
use crate::conditions::{evaluate, EvaluationContext, SignalExecutor};
use crate::domain::action::PolicyId;
use crate::domain::condition::ConditionTrace;
use crate::domain::correlation::CorrelationId;
use crate::domain::item::ItemSubmission;
use crate::domain::job::QueueId;
use crate::domain::routing::{RoutingRule, RoutingRuleExecution, RuleRunStatus};
use crate::errors::{Classify, ErrorClass, StoreError};

pub use cache::RoutingRuleCache;
pub use jobs::JobRouter;
pub use rules::{
    compute_reorder, CreateRoutingRule, RoutingRuleError, RoutingRuleService, RoutingRuleStore,
    UpdateRoutingRule,
};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no routing rule matched and org `{org_id}` has no default queue")]
    NoDefaultQueue { org_id: String },
    #[error("default queue lookup failed for org `{org_id}`: {source}")]
    DefaultQueueLookup {
        org_id: String,
        #[source]
        source: StoreError,
    },
    #[error("routing rules could not be loaded: {0}")]
    Rules(#[source] StoreError),
    #[error("routing executions could not be logged: {0}")]
    ExecutionLog(#[source] StoreError),
    #[error("queue store rejected the job: {0}")]
    Enqueue(#[source] StoreError),
}

impl Classify for RoutingError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NoDefaultQueue { .. } | Self::DefaultQueueLookup { .. } => ErrorClass::Fatal,
            Self::Rules(_) | Self::ExecutionLog(_) | Self::Enqueue(_) => ErrorClass::Transient,
        }
    }
}

/// Evaluates routing rules in sequence order and records every rule's result.
pub struct RoutingEngine {
    signals: Arc<dyn SignalExecutor>,
    logger: Arc<dyn RoutingExecutionLogger>,
}

impl RoutingEngine {
    pub fn new(signals: Arc<dyn SignalExecutor>, logger: Arc<dyn RoutingExecutionLogger>) -> Self {
        Self { signals, logger }
    }

    /// Destination of the first passing rule. Rules after the match are logged as not run.
    pub async fn route(
        &self,
        rules: &[RoutingRule],
        item: &ItemSubmission,
        policy_ids: &[PolicyId],
        correlation_id: &CorrelationId,
    ) -> Result<Option<QueueId>, RoutingError> {
        let mut ordered: Vec<&RoutingRule> = rules.iter().collect();
        ordered.sort_by_key(|rule| rule.sequence_number);

        let context = EvaluationContext::new(item, self.signals.as_ref());
        let mut destination: Option<QueueId> = None;
        let mut executions = Vec::with_capacity(ordered.len());

        for rule in ordered {
            let (status, trace) = if destination.is_some() {
                (RuleRunStatus::NotRun, ConditionTrace::unevaluated(&rule.condition_set))
            } else if !rule.applies_to(&item.item.type_id) {
                (RuleRunStatus::NotApplicable, ConditionTrace::unevaluated(&rule.condition_set))
            } else {
                let evaluation = evaluate(&rule.condition_set, &context).await;
                if evaluation.passed {
                    destination = Some(rule.destination_queue_id.clone());
                    (RuleRunStatus::Passed, evaluation.trace)
                } else {
                    (RuleRunStatus::Failed, evaluation.trace)
                }
            };

            executions.push(RoutingRuleExecution {
                org_id: item.org_id.clone(),
                rule_id: rule.id.clone(),
                rule_version: rule.version,
                rule_name: rule.name.clone(),
                destination_queue_id: rule.destination_queue_id.clone(),
                item_id: item.item.id.clone(),
                item_type_id: item.item.type_id.clone(),
                status,
                trace,
                policy_ids: policy_ids.to_vec(),
                correlation_id: correlation_id.to_string(),
                occurred_at: Utc::now(),
            });
        }

        debug!(
            event_name = "routing.rules.evaluated",
            correlation_id = %correlation_id,
            org_id = %item.org_id.0,
            rules = executions.len(),
            matched = destination.is_some(),
            "routing rules evaluated"
        );

        self.logger
            .log_routing_rule_executions(executions)
            .await
            .map_err(RoutingError::ExecutionLog)?;

        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use super::{RoutingEngine, RoutingError};
    use crate::audit::InMemoryExecutionLog;
    use crate::conditions::TextSignals;
    use crate::domain::action::PolicyId;
    use crate::domain::correlation::{CorrelationId, CorrelationSource};
    use crate::domain::item::ItemTypeId;
    use crate::domain::job::QueueId;
    use crate::domain::routing::{RoutingRule, RoutingRuleId, RoutingRuleStatus, RuleRunStatus};
    use crate::testing::{org, submission, text_contains};

    fn rule(id: &str, sequence: i64, item_type: &str, words: &[&str]) -> RoutingRule {
        RoutingRule {
            id: RoutingRuleId(id.to_owned()),
            org_id: org(),
            name: id.to_owned(),
            description: None,
            status: RoutingRuleStatus::Live,
            condition_set: text_contains(words),
            destination_queue_id: QueueId(format!("queue-{id}")),
            item_type_ids: vec![ItemTypeId(item_type.to_owned())],
            sequence_number: sequence,
            version: Utc::now(),
            creator_id: "admin".to_owned(),
            is_appeals_rule: false,
        }
    }

    #[tokio::test]
    async fn first_passing_rule_wins_and_every_rule_is_logged() {
        let log = InMemoryExecutionLog::default();
        let engine = RoutingEngine::new(Arc::new(TextSignals), Arc::new(log.clone()));
        let rules = vec![
            rule("r4", 4, "post", &["spam"]),
            rule("r2", 2, "post", &["nothing-here"]),
            rule("r1", 1, "comment", &["spam"]),
            rule("r3", 3, "post", &["spam"]),
        ];
        let item = submission("item-1", "post", json!({ "body": "buy spam now" }));
        let correlation = CorrelationId::new(CorrelationSource::ItemSubmission, "req-1");

        let destination = engine
            .route(&rules, &item, &[PolicyId("p-1".to_owned())], &correlation)
            .await
            .expect("route");

        assert_eq!(destination, Some(QueueId("queue-r3".to_owned())));
        let logged: Vec<(String, RuleRunStatus)> = log
            .routing_executions()
            .into_iter()
            .map(|execution| (execution.rule_id.0, execution.status))
            .collect();
        assert_eq!(
            logged,
            vec![
                ("r1".to_owned(), RuleRunStatus::NotApplicable),
                ("r2".to_owned(), RuleRunStatus::Failed),
                ("r3".to_owned(), RuleRunStatus::Passed),
                ("r4".to_owned(), RuleRunStatus::NotRun),
            ]
        );
        let executions = log.routing_executions();
        assert!(executions.iter().all(|execution| execution.correlation_id == "item-submission:req-1"));
        assert!(executions[3].trace.outcome().is_none(), "not-run rules carry an unevaluated trace");
    }

    #[tokio::test]
    async fn no_match_returns_none() {
        let log = InMemoryExecutionLog::default();
        let engine = RoutingEngine::new(Arc::new(TextSignals), Arc::new(log.clone()));
        let item = submission("item-1", "post", json!({ "body": "hello" }));
        let correlation = CorrelationId::generate(CorrelationSource::ItemSubmission);

        let destination = engine
            .route(&[rule("r1", 1, "post", &["spam"])], &item, &[], &correlation)
            .await
            .expect("route");

        assert_eq!(destination, None);
        assert_eq!(log.routing_executions()[0].status, RuleRunStatus::Failed);
    }

    #[tokio::test]
    async fn execution_log_failure_is_surfaced() {
        let log = InMemoryExecutionLog::default();
        log.set_failing(true);
        let engine = RoutingEngine::new(Arc::new(TextSignals), Arc::new(log));
        let item = submission("item-1", "post", json!({ "body": "spam" }));
        let correlation = CorrelationId::generate(CorrelationSource::ItemSubmission);

        let error = engine
            .route(&[rule("r1", 1, "post", &["spam"])], &item, &[], &correlation)
            .await
            .expect_err("log failure");
        assert!(matches!(error, RoutingError::ExecutionLog(_)));
    }
}
