use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::info;

use crate::domain::condition::ConditionSet;
use crate::domain::item::{ItemTypeId, OrgId};
use crate::domain::job::QueueId;
use crate::domain::routing::{
    RoutingRule, RoutingRuleId, RoutingRuleStatus, RoutingRuleVersion, SequenceChange,
};
use crate::errors::{Classify, ErrorClass, StoreError};
use crate::queue::QueueStore;

#[async_trait]
pub trait RoutingRuleStore: Send + Sync {
    /// Current rules of the org, ascending by sequence number.
    async fn list_current_rules(&self, org_id: &OrgId) -> Result<Vec<RoutingRule>, StoreError>;

    async fn find_rule(
        &self,
        org_id: &OrgId,
        id: &RoutingRuleId,
    ) -> Result<Option<RoutingRule>, StoreError>;

    async fn next_sequence_number(&self, org_id: &OrgId) -> Result<i64, StoreError>;

    /// Inserts the rule together with its first version row.
    /// A duplicate name within the org is reported as `StoreError::UniqueViolation`.
    async fn insert_rule(&self, rule: &RoutingRule) -> Result<(), StoreError>;

    /// Overwrites the rule. With `new_version` the previous version row stops being current
    /// and a new one is appended.
    async fn update_rule(&self, rule: &RoutingRule, new_version: bool) -> Result<(), StoreError>;

    /// Returns whether a rule was deleted.
    async fn delete_rule(&self, org_id: &OrgId, id: &RoutingRuleId) -> Result<bool, StoreError>;

    /// Applies every change in a single statement.
    async fn apply_sequence_changes(
        &self,
        org_id: &OrgId,
        changes: &[SequenceChange],
    ) -> Result<(), StoreError>;

    /// Version history, newest first.
    async fn list_versions(
        &self,
        org_id: &OrgId,
        id: &RoutingRuleId,
    ) -> Result<Vec<RoutingRuleVersion>, StoreError>;
}

#[derive(Debug, Error)]
pub enum RoutingRuleError {
    #[error("a routing rule named `{name}` already exists")]
    NameTaken { name: String },
    #[error("routing rule `{id}` not found")]
    NotFound { id: String },
    #[error("queue `{queue_id}` does not exist")]
    QueueNotFound { queue_id: String },
    #[error("invalid routing rule: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for RoutingRuleError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NameTaken { .. }
            | Self::NotFound { .. }
            | Self::QueueNotFound { .. }
            | Self::Invalid(_) => ErrorClass::Validation,
            Self::Store(error) => error.class(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreateRoutingRule {
    pub org_id: OrgId,
    pub name: String,
    pub description: Option<String>,
    pub condition_set: ConditionSet,
    pub destination_queue_id: QueueId,
    pub item_type_ids: Vec<ItemTypeId>,
    pub creator_id: String,
    pub is_appeals_rule: bool,
    /// One-based position to insert at; appended after the last rule when absent.
    pub sequence_number: Option<i64>,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateRoutingRule {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub condition_set: Option<ConditionSet>,
    pub destination_queue_id: Option<QueueId>,
    pub item_type_ids: Option<Vec<ItemTypeId>>,
    pub sequence_number: Option<i64>,
}

pub struct RoutingRuleService {
    store: Arc<dyn RoutingRuleStore>,
    queues: Arc<dyn QueueStore>,
}

impl RoutingRuleService {
    pub fn new(store: Arc<dyn RoutingRuleStore>, queues: Arc<dyn QueueStore>) -> Self {
        Self { store, queues }
    }

    pub async fn create(&self, input: CreateRoutingRule) -> Result<RoutingRule, RoutingRuleError> {
        validate_shape(&input.name, &input.condition_set, &input.item_type_ids)?;
        self.ensure_queue(&input.org_id, &input.destination_queue_id).await?;

        let rule = RoutingRule {
            id: RoutingRuleId(uuid::Uuid::new_v4().to_string()),
            sequence_number: self.store.next_sequence_number(&input.org_id).await?,
            org_id: input.org_id,
            name: input.name,
            description: input.description,
            status: RoutingRuleStatus::Live,
            condition_set: input.condition_set,
            destination_queue_id: input.destination_queue_id,
            item_type_ids: input.item_type_ids,
            version: Utc::now(),
            creator_id: input.creator_id,
            is_appeals_rule: input.is_appeals_rule,
        };
        self.store.insert_rule(&rule).await.map_err(|error| name_conflict(error, &rule.name))?;

        info!(
            event_name = "routing.rule.created",
            org_id = %rule.org_id.0,
            rule_id = %rule.id.0,
            sequence_number = rule.sequence_number,
            "routing rule created"
        );

        match input.sequence_number {
            Some(position) => self.move_to(&rule.org_id, &rule.id, position).await,
            None => Ok(rule),
        }
    }

    pub async fn update(
        &self,
        org_id: &OrgId,
        id: &RoutingRuleId,
        patch: UpdateRoutingRule,
    ) -> Result<RoutingRule, RoutingRuleError> {
        let mut rule = self
            .store
            .find_rule(org_id, id)
            .await?
            .ok_or_else(|| RoutingRuleError::NotFound { id: id.0.clone() })?;

        let mut versioned = false;
        if let Some(name) = patch.name {
            rule.name = name;
        }
        if let Some(description) = patch.description {
            rule.description = description;
        }
        if let Some(condition_set) = patch.condition_set {
            versioned |= condition_set != rule.condition_set;
            rule.condition_set = condition_set;
        }
        if let Some(queue_id) = patch.destination_queue_id {
            if queue_id != rule.destination_queue_id {
                self.ensure_queue(org_id, &queue_id).await?;
                versioned = true;
            }
            rule.destination_queue_id = queue_id;
        }
        if let Some(item_type_ids) = patch.item_type_ids {
            versioned |= item_type_ids != rule.item_type_ids;
            rule.item_type_ids = item_type_ids;
        }
        validate_shape(&rule.name, &rule.condition_set, &rule.item_type_ids)?;

        if versioned {
            rule.version = next_version(rule.version);
        }
        self.store
            .update_rule(&rule, versioned)
            .await
            .map_err(|error| name_conflict(error, &rule.name))?;

        info!(
            event_name = "routing.rule.updated",
            org_id = %org_id.0,
            rule_id = %id.0,
            new_version = versioned,
            "routing rule updated"
        );

        match patch.sequence_number {
            Some(position) => self.move_to(org_id, id, position).await,
            None => Ok(rule),
        }
    }

    pub async fn delete(&self, org_id: &OrgId, id: &RoutingRuleId) -> Result<(), RoutingRuleError> {
        if !self.store.delete_rule(org_id, id).await? {
            return Err(RoutingRuleError::NotFound { id: id.0.clone() });
        }
        info!(
            event_name = "routing.rule.deleted",
            org_id = %org_id.0,
            rule_id = %id.0,
            "routing rule deleted"
        );
        Ok(())
    }

    /// Places `order` first, in the given order, followed by every other rule in its
    /// existing relative order. Returns the changes that were applied.
    pub async fn reorder(
        &self,
        org_id: &OrgId,
        order: &[RoutingRuleId],
    ) -> Result<Vec<SequenceChange>, RoutingRuleError> {
        let current = self.store.list_current_rules(org_id).await?;
        let changes = compute_reorder(&current, order)?;
        if !changes.is_empty() {
            self.store.apply_sequence_changes(org_id, &changes).await?;
        }
        info!(
            event_name = "routing.rules.reordered",
            org_id = %org_id.0,
            changed = changes.len(),
            "routing rules reordered"
        );
        Ok(changes)
    }

    pub async fn list_versions(
        &self,
        org_id: &OrgId,
        id: &RoutingRuleId,
    ) -> Result<Vec<RoutingRuleVersion>, RoutingRuleError> {
        let versions = self.store.list_versions(org_id, id).await?;
        if versions.is_empty() {
            return Err(RoutingRuleError::NotFound { id: id.0.clone() });
        }
        Ok(versions)
    }

    async fn move_to(
        &self,
        org_id: &OrgId,
        id: &RoutingRuleId,
        position: i64,
    ) -> Result<RoutingRule, RoutingRuleError> {
        let current = self.store.list_current_rules(org_id).await?;
        let mut order: Vec<RoutingRuleId> =
            current.iter().map(|rule| rule.id.clone()).filter(|rule_id| rule_id != id).collect();
        let index = usize::try_from(position.saturating_sub(1)).unwrap_or(0).min(order.len());
        order.insert(index, id.clone());

        let changes = compute_reorder(&current, &order)?;
        if !changes.is_empty() {
            self.store.apply_sequence_changes(org_id, &changes).await?;
        }
        self.store
            .find_rule(org_id, id)
            .await?
            .ok_or_else(|| RoutingRuleError::NotFound { id: id.0.clone() })
    }

    async fn ensure_queue(&self, org_id: &OrgId, queue_id: &QueueId) -> Result<(), RoutingRuleError> {
        if self.queues.check_queue_exists(org_id, queue_id).await? {
            Ok(())
        } else {
            Err(RoutingRuleError::QueueNotFound { queue_id: queue_id.0.clone() })
        }
    }
}

/// Maps every current rule to its new one-based sequence number and keeps the entries
/// whose number changes.
pub fn compute_reorder(
    current: &[RoutingRule],
    order: &[RoutingRuleId],
) -> Result<Vec<SequenceChange>, RoutingRuleError> {
    let known: HashSet<&RoutingRuleId> = current.iter().map(|rule| &rule.id).collect();
    let mut listed = HashSet::new();
    for id in order {
        if !known.contains(id) {
            return Err(RoutingRuleError::NotFound { id: id.0.clone() });
        }
        if !listed.insert(id) {
            return Err(RoutingRuleError::Invalid(format!("rule `{}` listed twice", id.0)));
        }
    }

    let mut remaining: Vec<&RoutingRule> =
        current.iter().filter(|rule| !listed.contains(&rule.id)).collect();
    remaining.sort_by_key(|rule| rule.sequence_number);

    let by_id = |id: &RoutingRuleId| current.iter().find(|rule| &rule.id == id);
    let final_order = order.iter().filter_map(by_id).chain(remaining);

    Ok(final_order
        .zip(1_i64..)
        .filter(|(rule, to)| rule.sequence_number != *to)
        .map(|(rule, to)| SequenceChange { rule_id: rule.id.clone(), from: rule.sequence_number, to })
        .collect())
}

fn validate_shape(
    name: &str,
    condition_set: &ConditionSet,
    item_type_ids: &[ItemTypeId],
) -> Result<(), RoutingRuleError> {
    if name.trim().is_empty() {
        return Err(RoutingRuleError::Invalid("name must not be empty".to_owned()));
    }
    if item_type_ids.is_empty() {
        return Err(RoutingRuleError::Invalid("at least one item type is required".to_owned()));
    }
    condition_set.validate().map_err(RoutingRuleError::Invalid)
}

fn name_conflict(error: StoreError, name: &str) -> RoutingRuleError {
    match error {
        StoreError::UniqueViolation(_) => RoutingRuleError::NameTaken { name: name.to_owned() },
        other => RoutingRuleError::Store(other),
    }
}

/// Versions are timestamps; a new one must sort after the previous even on a fast clock.
fn next_version(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::{
        compute_reorder, CreateRoutingRule, RoutingRuleError, RoutingRuleService,
        UpdateRoutingRule,
    };
    use crate::domain::condition::{ConditionSet, Conjunction};
    use crate::domain::item::ItemTypeId;
    use crate::domain::job::QueueId;
    use crate::domain::routing::{RoutingRule, RoutingRuleId, RoutingRuleStatus, SequenceChange};
    use crate::memory::{InMemoryQueueStore, InMemoryRoutingRuleStore};
    use crate::testing::{org, text_contains};

    fn stored(id: &str, sequence: i64) -> RoutingRule {
        RoutingRule {
            id: RoutingRuleId(id.to_owned()),
            org_id: org(),
            name: id.to_owned(),
            description: None,
            status: RoutingRuleStatus::Live,
            condition_set: text_contains(&["spam"]),
            destination_queue_id: QueueId("q".to_owned()),
            item_type_ids: vec![ItemTypeId("post".to_owned())],
            sequence_number: sequence,
            version: Utc::now(),
            creator_id: "admin".to_owned(),
            is_appeals_rule: false,
        }
    }

    fn ids(values: &[&str]) -> Vec<RoutingRuleId> {
        values.iter().map(|value| RoutingRuleId((*value).to_owned())).collect()
    }

    fn create(name: &str) -> CreateRoutingRule {
        CreateRoutingRule {
            org_id: org(),
            name: name.to_owned(),
            description: None,
            condition_set: text_contains(&["spam"]),
            destination_queue_id: QueueId("review".to_owned()),
            item_type_ids: vec![ItemTypeId("post".to_owned())],
            creator_id: "admin".to_owned(),
            is_appeals_rule: false,
            sequence_number: None,
        }
    }

    fn service() -> (RoutingRuleService, InMemoryRoutingRuleStore) {
        let store = InMemoryRoutingRuleStore::default();
        let queues = InMemoryQueueStore::default();
        queues.add_queue(&org(), QueueId("review".to_owned()), true);
        queues.add_queue(&org(), QueueId("escalation".to_owned()), false);
        (RoutingRuleService::new(Arc::new(store.clone()), Arc::new(queues)), store)
    }

    #[test]
    fn reorder_moves_listed_rules_first_and_keeps_the_rest() {
        let current = vec![stored("a", 1), stored("b", 2), stored("c", 3), stored("d", 4)];

        let changes = compute_reorder(&current, &ids(&["c", "a"])).expect("reorder");

        assert_eq!(
            changes,
            vec![
                SequenceChange { rule_id: RoutingRuleId("c".to_owned()), from: 3, to: 1 },
                SequenceChange { rule_id: RoutingRuleId("a".to_owned()), from: 1, to: 2 },
                SequenceChange { rule_id: RoutingRuleId("b".to_owned()), from: 2, to: 3 },
            ]
        );
    }

    #[test]
    fn reorder_rejects_unknown_and_duplicate_ids() {
        let current = vec![stored("a", 1), stored("b", 2)];

        assert!(matches!(
            compute_reorder(&current, &ids(&["zz"])),
            Err(RoutingRuleError::NotFound { .. })
        ));
        assert!(matches!(
            compute_reorder(&current, &ids(&["a", "a"])),
            Err(RoutingRuleError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn create_appends_and_rejects_duplicate_names() {
        let (service, _) = service();

        let first = service.create(create("spam")).await.expect("first");
        let second = service.create(create("scams")).await.expect("second");
        assert_eq!((first.sequence_number, second.sequence_number), (1, 2));

        let duplicate = service.create(create("spam")).await.expect_err("duplicate");
        assert!(matches!(duplicate, RoutingRuleError::NameTaken { .. }));
    }

    #[tokio::test]
    async fn create_validates_queue_and_shape() {
        let (service, _) = service();

        let mut missing_queue = create("a");
        missing_queue.destination_queue_id = QueueId("nope".to_owned());
        assert!(matches!(
            service.create(missing_queue).await,
            Err(RoutingRuleError::QueueNotFound { .. })
        ));

        let mut no_types = create("b");
        no_types.item_type_ids.clear();
        assert!(matches!(service.create(no_types).await, Err(RoutingRuleError::Invalid(_))));

        let mut empty = create("c");
        empty.condition_set = ConditionSet { conjunction: Conjunction::And, conditions: vec![] };
        assert!(matches!(service.create(empty).await, Err(RoutingRuleError::Invalid(_))));
    }

    #[tokio::test]
    async fn create_at_position_shifts_later_rules() {
        let (service, store) = service();
        let a = service.create(create("a")).await.expect("a");
        let b = service.create(create("b")).await.expect("b");

        let mut front = create("front");
        front.sequence_number = Some(1);
        let inserted = service.create(front).await.expect("front");
        assert_eq!(inserted.sequence_number, 1);

        let order: Vec<RoutingRuleId> =
            store.rules(&org()).into_iter().map(|rule| rule.id).collect();
        assert_eq!(order, vec![inserted.id, a.id, b.id]);
    }

    #[tokio::test]
    async fn only_routing_changes_create_a_new_version() {
        let (service, _) = service();
        let rule = service.create(create("spam")).await.expect("create");

        let renamed = service
            .update(
                &org(),
                &rule.id,
                UpdateRoutingRule { name: Some("spam v2".to_owned()), ..Default::default() },
            )
            .await
            .expect("rename");
        assert_eq!(renamed.version, rule.version);
        assert_eq!(service.list_versions(&org(), &rule.id).await.expect("versions").len(), 1);

        let moved = service
            .update(
                &org(),
                &rule.id,
                UpdateRoutingRule {
                    destination_queue_id: Some(QueueId("escalation".to_owned())),
                    ..Default::default()
                },
            )
            .await
            .expect("requeue");
        assert!(moved.version > rule.version);

        let versions = service.list_versions(&org(), &rule.id).await.expect("versions");
        assert_eq!(versions.len(), 2);
        assert!(versions[0].is_current);
        assert_eq!(versions[0].destination_queue_id, QueueId("escalation".to_owned()));
        assert!(!versions[1].is_current);
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_rules() {
        let (service, _) = service();
        let missing = RoutingRuleId("missing".to_owned());

        assert!(matches!(
            service.update(&org(), &missing, UpdateRoutingRule::default()).await,
            Err(RoutingRuleError::NotFound { .. })
        ));
        assert!(matches!(
            service.delete(&org(), &missing).await,
            Err(RoutingRuleError::NotFound { .. })
        ));
    }
}
