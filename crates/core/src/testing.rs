//! Builders shared by unit tests across the crate.

use chrono::{TimeZone, Utc};
use serde_json::Value;

use crate::domain::condition::{
    Condition, ConditionInput, ConditionSet, Conjunction, LeafCondition, SignalRef,
};
use crate::domain::item::{ItemIdentifier, ItemSubmission, ItemTypeKind, OrgId};

pub fn org() -> OrgId {
    OrgId("org-1".to_owned())
}

pub fn submission(item_id: &str, type_id: &str, data: Value) -> ItemSubmission {
    ItemSubmission {
        submission_id: format!("sub-{item_id}"),
        org_id: org(),
        item: ItemIdentifier::new(item_id, type_id),
        item_type_kind: ItemTypeKind::Content,
        item_type_version: "1".to_owned(),
        item_type_schema_variant: "original".to_owned(),
        data: data.as_object().cloned().unwrap_or_default(),
        creator: None,
        thread: None,
        created_at: None,
        submission_time: Utc.with_ymd_and_hms(2026, 3, 4, 10, 27, 5).single().unwrap_or_default(),
    }
}

/// Passes when any text in the item contains one of `words`.
pub fn text_contains(words: &[&str]) -> ConditionSet {
    ConditionSet {
        conjunction: Conjunction::And,
        conditions: vec![Condition::Leaf(LeafCondition {
            input: ConditionInput::AllText,
            signal: Some(SignalRef { id: "text_contains".to_owned(), subcategory: None }),
            matching_values: words.iter().map(|word| (*word).to_owned()).collect(),
            comparator: None,
            threshold: None,
        })],
    }
}
