use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorrelationSource {
    ItemSubmission,
    ReviewDecision,
    PostActions,
    UserStrikeActionExecution,
}

impl CorrelationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ItemSubmission => "item-submission",
            Self::ReviewDecision => "review-decision",
            Self::PostActions => "post-actions",
            Self::UserStrikeActionExecution => "user-strike-action-execution",
        }
    }
}

/// Ties together every log row produced by one upstream request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId {
    pub source: CorrelationSource,
    pub id: String,
}

impl CorrelationId {
    pub fn new(source: CorrelationSource, id: impl Into<String>) -> Self {
        Self { source, id: id.into() }
    }

    pub fn generate(source: CorrelationSource) -> Self {
        Self::new(source, Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.as_str(), self.id)
    }
}
