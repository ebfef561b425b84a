use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::action::{Action, Policy};
use crate::domain::condition::{ConditionSet, ConditionTrace};
use crate::domain::item::{ItemIdentifier, ItemTypeId, OrgId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Live,
    Background,
    Draft,
    Deprecated,
    Expired,
    Archived,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Background => "background",
            Self::Draft => "draft",
            Self::Deprecated => "deprecated",
            Self::Expired => "expired",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "live" => Some(Self::Live),
            "background" => Some(Self::Background),
            "draft" => Some(Self::Draft),
            "deprecated" => Some(Self::Deprecated),
            "expired" => Some(Self::Expired),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Enabled rules are evaluated on every submission.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Live | Self::Background)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEnvironment {
    Live,
    Background,
    Manual,
}

impl RuleEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Background => "background",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "live" => Some(Self::Live),
            "background" => Some(Self::Background),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// A moderation rule with its actions and policies resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub org_id: OrgId,
    pub name: String,
    pub status: RuleStatus,
    pub condition_set: ConditionSet,
    pub item_type_ids: Vec<ItemTypeId>,
    pub actions: Vec<Action>,
    pub policies: Vec<Policy>,
    pub version: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleExecution {
    pub org_id: OrgId,
    pub rule_id: RuleId,
    pub rule_name: String,
    pub rule_version: DateTime<Utc>,
    pub environment: RuleEnvironment,
    pub item: ItemIdentifier,
    pub passed: bool,
    pub trace: ConditionTrace,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
}
