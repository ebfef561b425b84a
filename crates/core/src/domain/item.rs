use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrgId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemTypeId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemIdentifier {
    pub id: String,
    pub type_id: ItemTypeId,
}

impl ItemIdentifier {
    pub fn new(id: impl Into<String>, type_id: impl Into<String>) -> Self {
        Self { id: id.into(), type_id: ItemTypeId(type_id.into()) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemTypeKind {
    Content,
    User,
    Thread,
}

impl ItemTypeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::User => "user",
            Self::Thread => "thread",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "content" => Some(Self::Content),
            "user" => Some(Self::User),
            "thread" => Some(Self::Thread),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Url,
    Id,
    RelatedItem,
    Datetime,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

/// Names the schema fields that carry a structural meaning for the item.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRoles {
    pub creator_id: Option<String>,
    pub thread_id: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemType {
    pub id: ItemTypeId,
    pub org_id: OrgId,
    pub name: String,
    pub kind: ItemTypeKind,
    pub version: String,
    pub schema_variant: String,
    pub fields: Vec<FieldSchema>,
    pub roles: FieldRoles,
}

impl ItemType {
    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|field| field.required)
    }
}

/// A fully reconstructed item, as evaluated by rules and stored for investigation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemSubmission {
    pub submission_id: String,
    pub org_id: OrgId,
    pub item: ItemIdentifier,
    pub item_type_kind: ItemTypeKind,
    pub item_type_version: String,
    pub item_type_schema_variant: String,
    pub data: Map<String, Value>,
    pub creator: Option<ItemIdentifier>,
    pub thread: Option<ItemIdentifier>,
    pub created_at: Option<DateTime<Utc>>,
    pub submission_time: DateTime<Utc>,
}

impl ItemSubmission {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name).filter(|value| !value.is_null())
    }

    /// Every non-empty string value in the item, in field order.
    pub fn text_values(&self) -> Vec<String> {
        let mut values = Vec::new();
        for value in self.data.values() {
            collect_text(value, &mut values);
        }
        values
    }
}

fn collect_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) if !text.trim().is_empty() => out.push(text.clone()),
        Value::Array(entries) => entries.iter().for_each(|entry| collect_text(entry, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{ItemIdentifier, ItemSubmission, ItemTypeKind, OrgId};

    #[test]
    fn text_values_flatten_strings_and_skip_blank_entries() {
        let data = json!({
            "title": "hello",
            "tags": ["a", "  ", "b"],
            "score": 3,
            "body": ""
        });
        let submission = ItemSubmission {
            submission_id: "sub-1".to_owned(),
            org_id: OrgId("org-1".to_owned()),
            item: ItemIdentifier::new("item-1", "post"),
            item_type_kind: ItemTypeKind::Content,
            item_type_version: "1".to_owned(),
            item_type_schema_variant: "original".to_owned(),
            data: data.as_object().cloned().unwrap_or_default(),
            creator: None,
            thread: None,
            created_at: None,
            submission_time: Utc::now(),
        };

        let mut values = submission.text_values();
        values.sort();
        assert_eq!(values, vec!["a", "b", "hello"]);
        assert!(submission.field("missing").is_none());
    }

    #[test]
    fn item_type_kind_round_trips_through_text() {
        for kind in [ItemTypeKind::Content, ItemTypeKind::User, ItemTypeKind::Thread] {
            assert_eq!(ItemTypeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ItemTypeKind::parse("unknown"), None);
    }
}
