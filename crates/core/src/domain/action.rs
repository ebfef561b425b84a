use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::correlation::CorrelationId;
use crate::domain::item::{ItemIdentifier, ItemSubmission, ItemTypeKind, OrgId};
use crate::domain::job::JobId;
use crate::domain::rule::{RuleEnvironment, RuleId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub String);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    CustomWebhook {
        callback_url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        custom_params: Map<String, Value>,
    },
    EnqueueToReview,
    EnqueueToEscalation,
    EnqueueAuthorToReview,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomWebhook { .. } => "custom_webhook",
            Self::EnqueueToReview => "enqueue_to_review",
            Self::EnqueueToEscalation => "enqueue_to_escalation",
            Self::EnqueueAuthorToReview => "enqueue_author_to_review",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub org_id: OrgId,
    pub name: String,
    pub kind: ActionKind,
    pub apply_user_strikes: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub org_id: OrgId,
    pub name: String,
    pub penalty: String,
    pub user_strike_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingRule {
    pub id: RuleId,
    pub name: String,
    pub version: DateTime<Utc>,
}

/// An action selected for dispatch, along with the context that selected it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggeredAction {
    pub action: Action,
    pub policies: Vec<Policy>,
    pub matching_rules: Vec<MatchingRule>,
    pub rule_environment: Option<RuleEnvironment>,
}

impl TriggeredAction {
    pub fn manual(action: Action, policies: Vec<Policy>) -> Self {
        Self { action, policies, matching_rules: Vec::new(), rule_environment: None }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionTarget {
    Submission(Box<ItemSubmission>),
    Identifier { item: ItemIdentifier, kind: ItemTypeKind },
}

impl ActionTarget {
    pub fn identifier(&self) -> &ItemIdentifier {
        match self {
            Self::Submission(submission) => &submission.item,
            Self::Identifier { item, .. } => item,
        }
    }

    pub fn kind(&self) -> ItemTypeKind {
        match self {
            Self::Submission(submission) => submission.item_type_kind,
            Self::Identifier { kind, .. } => *kind,
        }
    }

    pub fn submission(&self) -> Option<&ItemSubmission> {
        match self {
            Self::Submission(submission) => Some(submission),
            Self::Identifier { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishContext {
    pub org_id: OrgId,
    pub correlation_id: CorrelationId,
    pub target: ActionTarget,
    pub actor_id: Option<String>,
    pub actor_email: Option<String>,
    pub job_id: Option<JobId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: ActionId,
    pub target: ItemIdentifier,
    pub success: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionExecution {
    pub org_id: OrgId,
    pub action_id: ActionId,
    pub action_name: String,
    pub target: ItemIdentifier,
    pub policy_ids: Vec<PolicyId>,
    pub matching_rule_ids: Vec<RuleId>,
    pub rule_environment: Option<RuleEnvironment>,
    pub correlation_id: String,
    pub actor_id: Option<String>,
    pub job_id: Option<JobId>,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
