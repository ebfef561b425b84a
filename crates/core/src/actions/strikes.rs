//! Aggregate user strikes recorded when actions enforce a policy.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::ModerationCatalog;
use crate::domain::action::{Action, ActionId, Policy, PolicyId, TriggeredAction};
use crate::domain::item::{ItemIdentifier, ItemTypeKind, OrgId};
use crate::errors::StoreError;

/// Once a user's strike total reaches `threshold`, `action_ids` run against the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrikeThreshold {
    pub org_id: OrgId,
    pub threshold: u32,
    pub action_ids: Vec<ActionId>,
}

#[async_trait]
pub trait StrikeStore: Send + Sync {
    /// Adds `count` strikes and returns the user's new total.
    async fn record_strikes(
        &self,
        org_id: &OrgId,
        user: &ItemIdentifier,
        policy_id: &PolicyId,
        count: u32,
    ) -> Result<u32, StoreError>;

    async fn get_thresholds(&self, org_id: &OrgId) -> Result<Vec<StrikeThreshold>, StoreError>;
}

/// Strikes to apply for one published batch of actions.
#[derive(Clone, Debug, PartialEq)]
pub struct StrikeCandidate {
    pub user: ItemIdentifier,
    pub policy: Policy,
}

impl StrikeCandidate {
    /// The most severe striking policy among actions that apply strikes, aimed at the
    /// target itself for user items and at its creator otherwise.
    pub fn select(
        triggered: &[TriggeredAction],
        target: &ItemIdentifier,
        target_kind: ItemTypeKind,
        creator: Option<&ItemIdentifier>,
    ) -> Option<Self> {
        let policy = triggered
            .iter()
            .filter(|entry| entry.action.apply_user_strikes)
            .flat_map(|entry| entry.policies.iter())
            .filter(|policy| policy.user_strike_count > 0)
            .max_by_key(|policy| policy.user_strike_count)?
            .clone();

        let user = match target_kind {
            ItemTypeKind::User => target.clone(),
            ItemTypeKind::Content | ItemTypeKind::Thread => creator?.clone(),
        };
        Some(Self { user, policy })
    }
}

pub struct UserStrikeService {
    store: Arc<dyn StrikeStore>,
    catalog: Arc<dyn ModerationCatalog>,
}

impl UserStrikeService {
    pub fn new(store: Arc<dyn StrikeStore>, catalog: Arc<dyn ModerationCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Records the strikes and returns the actions of the highest threshold the new total
    /// crossed, if any.
    pub async fn apply(
        &self,
        org_id: &OrgId,
        candidate: &StrikeCandidate,
    ) -> Result<Vec<Action>, StoreError> {
        let count = candidate.policy.user_strike_count;
        let total =
            self.store.record_strikes(org_id, &candidate.user, &candidate.policy.id, count).await?;
        let previous = total.saturating_sub(count);

        let crossed = self
            .store
            .get_thresholds(org_id)
            .await?
            .into_iter()
            .filter(|threshold| threshold.threshold > previous && threshold.threshold <= total)
            .max_by_key(|threshold| threshold.threshold);

        match crossed {
            Some(threshold) => self.catalog.get_actions(org_id, &threshold.action_ids).await,
            None => Ok(Vec::new()),
        }
    }
}
