use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::action::PolicyId;
use crate::domain::item::{ItemIdentifier, ItemSubmission, OrgId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Review,
    Appeal,
    Escalation,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Appeal => "appeal",
            Self::Escalation => "escalation",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueSource {
    RuleExecution,
    PostActions,
    Report,
    Appeal,
    Requeue,
}

impl EnqueueSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleExecution => "rule_execution",
            Self::PostActions => "post_actions",
            Self::Report => "report",
            Self::Appeal => "appeal",
            Self::Requeue => "requeue",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub kind: JobKind,
    pub item: ItemSubmission,
    pub enqueue_source: EnqueueSource,
    #[serde(default)]
    pub policy_ids: Vec<PolicyId>,
    #[serde(default)]
    pub reported_items: Vec<ItemIdentifier>,
    #[serde(default)]
    pub thread_items: Vec<ItemSubmission>,
    #[serde(default)]
    pub appeal_id: Option<String>,
}

impl JobPayload {
    pub fn review(item: ItemSubmission, enqueue_source: EnqueueSource) -> Self {
        Self {
            kind: JobKind::Review,
            item,
            enqueue_source,
            policy_ids: Vec::new(),
            reported_items: Vec::new(),
            thread_items: Vec::new(),
            appeal_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub org_id: OrgId,
    pub queue_id: QueueId,
    pub payload: JobPayload,
    pub lock_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(org_id: OrgId, queue_id: QueueId, payload: JobPayload) -> Self {
        Self {
            id: JobId(uuid::Uuid::new_v4().to_string()),
            org_id,
            queue_id,
            payload,
            lock_token: None,
            created_at: Utc::now(),
        }
    }
}
