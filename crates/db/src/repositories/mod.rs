//! sqlite implementations of the storage ports declared in `triage-core`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use triage_core::errors::StoreError;

pub mod catalog;
pub mod dead_letter;
pub mod decision;
pub mod execution_log;
pub mod investigation;
pub mod queue;
pub mod routing_rule;
pub mod strikes;

pub use catalog::SqlModerationCatalog;
pub use dead_letter::SqlDeadLetterSink;
pub use decision::SqlDecisionLog;
pub use execution_log::SqlExecutionLog;
pub use investigation::SqlItemInvestigation;
pub use queue::SqlQueueStore;
pub use routing_rule::SqlRoutingRuleStore;
pub use strikes::SqlStrikeStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(sqlx::Error::Database(database))
                if database.is_unique_violation() =>
            {
                StoreError::UniqueViolation(database.message().to_string())
            }
            RepositoryError::Database(sqlx::Error::RowNotFound) => {
                StoreError::NotFound("row not found".to_string())
            }
            RepositoryError::Database(sqlx::Error::ColumnDecode { index, source }) => {
                StoreError::Decode(format!("column {index}: {source}"))
            }
            RepositoryError::Database(other) => StoreError::Unavailable(other.to_string()),
            RepositoryError::Decode(message) => StoreError::Decode(message),
        }
    }
}

pub(crate) fn db(error: sqlx::Error) -> StoreError {
    RepositoryError::Database(error).into()
}

pub(crate) fn decode(error: impl std::fmt::Display) -> StoreError {
    RepositoryError::Decode(error.to_string()).into()
}

/// Fixed-width RFC 3339 so that text order matches time order.
pub(crate) fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value).map(|parsed| parsed.with_timezone(&Utc)).map_err(decode)
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(decode)
}

pub(crate) fn from_json<T: DeserializeOwned>(value: &str) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(decode)
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use triage_core::domain::condition::{
        Condition, ConditionInput, ConditionSet, Conjunction, LeafCondition, SignalRef,
    };
    use triage_core::domain::item::{ItemIdentifier, ItemSubmission, ItemTypeKind, OrgId};

    use crate::{connect_with_settings, migrations, DbPool};

    pub async fn pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    pub fn org() -> OrgId {
        OrgId("org-1".to_string())
    }

    pub fn submission(submission_id: &str, item_id: &str, minute: u32) -> ItemSubmission {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 10, minute, 0).single().expect("timestamp");
        ItemSubmission {
            submission_id: submission_id.to_string(),
            org_id: org(),
            item: ItemIdentifier::new(item_id, "post"),
            item_type_kind: ItemTypeKind::Content,
            item_type_version: "1".to_string(),
            item_type_schema_variant: "original".to_string(),
            data: json!({"text": "hello there"}).as_object().cloned().unwrap_or_default(),
            creator: Some(ItemIdentifier::new("user-1", "user")),
            thread: None,
            created_at: Some(at),
            submission_time: at,
        }
    }

    pub fn text_contains(needle: &str) -> ConditionSet {
        ConditionSet {
            conjunction: Conjunction::And,
            conditions: vec![Condition::Leaf(LeafCondition {
                input: ConditionInput::AllText,
                signal: Some(SignalRef { id: "text_contains".to_string(), subcategory: None }),
                matching_values: vec![needle.to_string()],
                comparator: None,
                threshold: None,
            })],
        }
    }
}
