use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::action::{ActionId, PolicyId};
use crate::domain::item::{ItemTypeId, OrgId};
use crate::domain::job::{JobId, JobKind, JobPayload, QueueId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomaticCloseReason {
    ItemDeletedBeforeReview,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionComponent {
    Ignore,
    AcceptAppeal {
        appeal_id: String,
    },
    RejectAppeal {
        appeal_id: String,
    },
    CustomAction {
        action_ids: Vec<ActionId>,
        policy_ids: Vec<PolicyId>,
        item_ids: Vec<String>,
        item_type_id: ItemTypeId,
    },
    SubmitExternalReport {
        category: String,
        escalate_to_high_priority: bool,
    },
    TransformAndRequeue {
        new_job_kind: JobKind,
        original_queue_id: QueueId,
        new_queue_id: Option<QueueId>,
    },
    AutomaticClose {
        reason: AutomaticCloseReason,
    },
}

impl DecisionComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::AcceptAppeal { .. } => "accept_appeal",
            Self::RejectAppeal { .. } => "reject_appeal",
            Self::CustomAction { .. } => "custom_action",
            Self::SubmitExternalReport { .. } => "submit_external_report",
            Self::TransformAndRequeue { .. } => "transform_and_requeue",
            Self::AutomaticClose { .. } => "automatic_close",
        }
    }

    pub fn action_ids(&self) -> &[ActionId] {
        match self {
            Self::CustomAction { action_ids, .. } => action_ids,
            _ => &[],
        }
    }
}

/// User-level follow-up effects recorded alongside a decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedAction {
    pub action_ids: Vec<ActionId>,
    pub item_ids: Vec<String>,
    pub item_type_id: ItemTypeId,
    pub policy_ids: Vec<PolicyId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DecisionVerdict {
    Reviewed(Vec<DecisionComponent>),
    AutomaticClose(AutomaticCloseReason),
}

impl DecisionVerdict {
    pub fn into_components(self) -> Vec<DecisionComponent> {
        match self {
            Self::Reviewed(components) => components,
            Self::AutomaticClose(reason) => vec![DecisionComponent::AutomaticClose { reason }],
        }
    }
}

/// Append-only record of what was decided about a job. Its id is the job's id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: JobId,
    pub org_id: OrgId,
    pub queue_id: QueueId,
    pub reviewer_id: Option<String>,
    pub components: Vec<DecisionComponent>,
    pub related_actions: Vec<RelatedAction>,
    pub job_payload: JobPayload,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    pub fn is_automatic_close(&self) -> bool {
        self.components
            .iter()
            .any(|component| matches!(component, DecisionComponent::AutomaticClose { .. }))
    }
}
