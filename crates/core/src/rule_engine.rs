//! Runs an org's enabled moderation rules against a submitted item.
//!
//! Live and background rules are both evaluated and logged; only passing live rules publish
//! their actions. An action shared by several passing rules is published once, carrying
//! every matching rule and the union of their policies.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tracing::info;

use crate::actions::{ActionPublisher, PublishError};
use crate::audit::RuleExecutionLogger;
use crate::catalog::ModerationCatalog;
use crate::conditions::{evaluate, EvaluationContext, SignalExecutor};
use crate::domain::action::{
    ActionResult, ActionTarget, MatchingRule, PublishContext, TriggeredAction,
};
use crate::domain::correlation::CorrelationId;
use crate::domain::item::ItemSubmission;
use crate::domain::rule::{Rule, RuleEnvironment, RuleExecution, RuleId, RuleStatus};
use crate::errors::{Classify, ErrorClass, StoreError};

#[derive(Debug, Error)]
pub enum RuleEngineError {
    #[error("enabled rules could not be loaded: {0}")]
    Rules(#[source] StoreError),
    #[error("rule executions could not be logged: {0}")]
    ExecutionLog(#[source] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl Classify for RuleEngineError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Rules(error) | Self::ExecutionLog(error) => match error.class() {
                ErrorClass::Data => ErrorClass::Data,
                _ => ErrorClass::Transient,
            },
            Self::Publish(error) => error.class(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleRunSummary {
    pub rules_evaluated: usize,
    pub passed_live: Vec<RuleId>,
    pub passed_background: Vec<RuleId>,
    pub action_results: Vec<ActionResult>,
}

pub struct RuleEngine {
    catalog: Arc<dyn ModerationCatalog>,
    signals: Arc<dyn SignalExecutor>,
    logger: Arc<dyn RuleExecutionLogger>,
    publisher: ActionPublisher,
}

impl RuleEngine {
    pub fn new(
        catalog: Arc<dyn ModerationCatalog>,
        signals: Arc<dyn SignalExecutor>,
        logger: Arc<dyn RuleExecutionLogger>,
        publisher: ActionPublisher,
    ) -> Self {
        Self { catalog, signals, logger, publisher }
    }

    pub async fn run_enabled_rules(
        &self,
        item: &ItemSubmission,
        correlation_id: &CorrelationId,
    ) -> Result<RuleRunSummary, RuleEngineError> {
        let rules = self
            .catalog
            .get_enabled_rules(&item.org_id, &item.item.type_id)
            .await
            .map_err(RuleEngineError::Rules)?;

        let context = EvaluationContext::new(item, self.signals.as_ref());
        let evaluations =
            join_all(rules.iter().map(|rule| evaluate(&rule.condition_set, &context))).await;

        let mut summary = RuleRunSummary { rules_evaluated: rules.len(), ..Default::default() };
        let mut executions = Vec::with_capacity(rules.len());
        let mut passing_live: Vec<&Rule> = Vec::new();

        for (rule, evaluation) in rules.iter().zip(evaluations) {
            let environment = match rule.status {
                RuleStatus::Background => RuleEnvironment::Background,
                _ => RuleEnvironment::Live,
            };
            if evaluation.passed {
                match environment {
                    RuleEnvironment::Live => {
                        summary.passed_live.push(rule.id.clone());
                        passing_live.push(rule);
                    }
                    _ => summary.passed_background.push(rule.id.clone()),
                }
            }
            executions.push(RuleExecution {
                org_id: item.org_id.clone(),
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                rule_version: rule.version,
                environment,
                item: item.item.clone(),
                passed: evaluation.passed,
                trace: evaluation.trace,
                correlation_id: correlation_id.to_string(),
                occurred_at: Utc::now(),
            });
        }

        self.logger.log_rule_executions(executions).await.map_err(RuleEngineError::ExecutionLog)?;

        let triggered = triggered_actions(&passing_live);
        info!(
            event_name = "rules.evaluation.completed",
            correlation_id = %correlation_id,
            org_id = %item.org_id.0,
            item_id = %item.item.id,
            rules = summary.rules_evaluated,
            passed_live = summary.passed_live.len(),
            passed_background = summary.passed_background.len(),
            actions = triggered.len(),
            "enabled rules evaluated"
        );

        if !triggered.is_empty() {
            summary.action_results = self
                .publisher
                .publish_actions(
                    triggered,
                    PublishContext {
                        org_id: item.org_id.clone(),
                        correlation_id: correlation_id.clone(),
                        target: ActionTarget::Submission(Box::new(item.clone())),
                        actor_id: None,
                        actor_email: None,
                        job_id: None,
                    },
                )
                .await?;
        }
        Ok(summary)
    }
}

fn triggered_actions(rules: &[&Rule]) -> Vec<TriggeredAction> {
    let mut triggered: Vec<TriggeredAction> = Vec::new();
    for rule in rules {
        let matching = MatchingRule { id: rule.id.clone(), name: rule.name.clone(), version: rule.version };
        for action in &rule.actions {
            let index = match triggered.iter().position(|entry| entry.action.id == action.id) {
                Some(index) => index,
                None => {
                    triggered.push(TriggeredAction {
                        action: action.clone(),
                        policies: Vec::new(),
                        matching_rules: Vec::new(),
                        rule_environment: Some(RuleEnvironment::Live),
                    });
                    triggered.len() - 1
                }
            };
            let entry = &mut triggered[index];
            entry.matching_rules.push(matching.clone());
            for policy in &rule.policies {
                if !entry.policies.iter().any(|known| known.id == policy.id) {
                    entry.policies.push(policy.clone());
                }
            }
        }
    }
    triggered
}
