use async_trait::async_trait;

use crate::domain::action::{Action, ActionId, Policy, PolicyId};
use crate::domain::item::{ItemType, ItemTypeId, OrgId};
use crate::domain::rule::Rule;
use crate::errors::StoreError;

/// Read access to an organization's configured item types, rules, actions, and policies.
///
/// Lookups by id silently skip ids that do not resolve; callers decide whether a partial
/// result is acceptable.
#[async_trait]
pub trait ModerationCatalog: Send + Sync {
    async fn get_item_type(
        &self,
        org_id: &OrgId,
        item_type_id: &ItemTypeId,
    ) -> Result<Option<ItemType>, StoreError>;

    async fn get_actions(&self, org_id: &OrgId, ids: &[ActionId])
        -> Result<Vec<Action>, StoreError>;

    async fn get_policies(
        &self,
        org_id: &OrgId,
        ids: &[PolicyId],
    ) -> Result<Vec<Policy>, StoreError>;

    /// Live and background rules that apply to the item type.
    async fn get_enabled_rules(
        &self,
        org_id: &OrgId,
        item_type_id: &ItemTypeId,
    ) -> Result<Vec<Rule>, StoreError>;
}
