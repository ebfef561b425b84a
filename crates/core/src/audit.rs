use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::action::ActionExecution;
use crate::domain::item::{ItemIdentifier, OrgId};
use crate::domain::routing::RoutingRuleExecution;
use crate::domain::rule::RuleExecution;
use crate::errors::StoreError;

/// Outcome of processing one submitted item, written once rules have run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionLog {
    pub org_id: OrgId,
    pub request_id: String,
    pub submission_id: String,
    pub item: ItemIdentifier,
    pub rules_evaluated: usize,
    pub actions_published: usize,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait RoutingExecutionLogger: Send + Sync {
    async fn log_routing_rule_executions(
        &self,
        executions: Vec<RoutingRuleExecution>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RuleExecutionLogger: Send + Sync {
    async fn log_rule_executions(&self, executions: Vec<RuleExecution>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ActionExecutionLogger: Send + Sync {
    async fn log_action_executions(
        &self,
        executions: Vec<ActionExecution>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SubmissionLogger: Send + Sync {
    async fn log_submission(&self, entry: SubmissionLog) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Recorded {
    routing: Vec<RoutingRuleExecution>,
    rules: Vec<RuleExecution>,
    actions: Vec<ActionExecution>,
    submissions: Vec<SubmissionLog>,
    failing: bool,
}

/// Keeps every execution row in memory; can be switched into a failing mode.
#[derive(Clone, Default)]
pub struct InMemoryExecutionLog {
    recorded: Arc<Mutex<Recorded>>,
}

impl InMemoryExecutionLog {
    pub fn routing_executions(&self) -> Vec<RoutingRuleExecution> {
        self.with(|recorded| recorded.routing.clone())
    }

    pub fn rule_executions(&self) -> Vec<RuleExecution> {
        self.with(|recorded| recorded.rules.clone())
    }

    pub fn action_executions(&self) -> Vec<ActionExecution> {
        self.with(|recorded| recorded.actions.clone())
    }

    pub fn submissions(&self) -> Vec<SubmissionLog> {
        self.with(|recorded| recorded.submissions.clone())
    }

    pub fn set_failing(&self, failing: bool) {
        self.with(|recorded| recorded.failing = failing);
    }

    fn with<T>(&self, f: impl FnOnce(&mut Recorded) -> T) -> T {
        match self.recorded.lock() {
            Ok(mut recorded) => f(&mut recorded),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn append(&self, f: impl FnOnce(&mut Recorded)) -> Result<(), StoreError> {
        self.with(|recorded| {
            if recorded.failing {
                return Err(StoreError::Unavailable("execution log unavailable".to_string()));
            }
            f(recorded);
            Ok(())
        })
    }
}

#[async_trait]
impl RoutingExecutionLogger for InMemoryExecutionLog {
    async fn log_routing_rule_executions(
        &self,
        executions: Vec<RoutingRuleExecution>,
    ) -> Result<(), StoreError> {
        self.append(|recorded| recorded.routing.extend(executions))
    }
}

#[async_trait]
impl RuleExecutionLogger for InMemoryExecutionLog {
    async fn log_rule_executions(&self, executions: Vec<RuleExecution>) -> Result<(), StoreError> {
        self.append(|recorded| recorded.rules.extend(executions))
    }
}

#[async_trait]
impl ActionExecutionLogger for InMemoryExecutionLog {
    async fn log_action_executions(
        &self,
        executions: Vec<ActionExecution>,
    ) -> Result<(), StoreError> {
        self.append(|recorded| recorded.actions.extend(executions))
    }
}

#[async_trait]
impl SubmissionLogger for InMemoryExecutionLog {
    async fn log_submission(&self, entry: SubmissionLog) -> Result<(), StoreError> {
        self.append(|recorded| recorded.submissions.push(entry))
    }
}
