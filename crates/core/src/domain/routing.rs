use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::action::PolicyId;
use crate::domain::condition::{ConditionSet, ConditionTrace};
use crate::domain::item::{ItemTypeId, OrgId};
use crate::domain::job::QueueId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoutingRuleId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingRuleStatus {
    Live,
}

impl RoutingRuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "live" => Some(Self::Live),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: RoutingRuleId,
    pub org_id: OrgId,
    pub name: String,
    pub description: Option<String>,
    pub status: RoutingRuleStatus,
    pub condition_set: ConditionSet,
    pub destination_queue_id: QueueId,
    pub item_type_ids: Vec<ItemTypeId>,
    pub sequence_number: i64,
    pub version: DateTime<Utc>,
    pub creator_id: String,
    pub is_appeals_rule: bool,
}

impl RoutingRule {
    pub fn applies_to(&self, item_type_id: &ItemTypeId) -> bool {
        self.item_type_ids.iter().any(|candidate| candidate == item_type_id)
    }
}

/// Immutable snapshot written whenever a rule's conditions, queue, or item types change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingRuleVersion {
    pub rule_id: RoutingRuleId,
    pub version: DateTime<Utc>,
    pub name: String,
    pub condition_set: ConditionSet,
    pub destination_queue_id: QueueId,
    pub item_type_ids: Vec<ItemTypeId>,
    pub is_current: bool,
}

impl RoutingRuleVersion {
    pub fn of(rule: &RoutingRule) -> Self {
        Self {
            rule_id: rule.id.clone(),
            version: rule.version,
            name: rule.name.clone(),
            condition_set: rule.condition_set.clone(),
            destination_queue_id: rule.destination_queue_id.clone(),
            item_type_ids: rule.item_type_ids.clone(),
            is_current: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleRunStatus {
    NotApplicable,
    Failed,
    Passed,
    NotRun,
}

impl RuleRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotApplicable => "not_applicable",
            Self::Failed => "failed",
            Self::Passed => "passed",
            Self::NotRun => "not_run",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "not_applicable" => Some(Self::NotApplicable),
            "failed" => Some(Self::Failed),
            "passed" => Some(Self::Passed),
            "not_run" => Some(Self::NotRun),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceChange {
    pub rule_id: RoutingRuleId,
    pub from: i64,
    pub to: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingRuleExecution {
    pub org_id: OrgId,
    pub rule_id: RoutingRuleId,
    pub rule_version: DateTime<Utc>,
    pub rule_name: String,
    pub destination_queue_id: QueueId,
    pub item_id: String,
    pub item_type_id: ItemTypeId,
    pub status: RuleRunStatus,
    pub trace: ConditionTrace,
    pub policy_ids: Vec<PolicyId>,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
}
