//! In-memory implementations of every storage port, used by tests and the replay worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::actions::strikes::{StrikeStore, StrikeThreshold};
use crate::catalog::ModerationCatalog;
use crate::decisioning::DecisionLog;
use crate::domain::action::{Action, ActionId, Policy, PolicyId};
use crate::domain::decision::Decision;
use crate::domain::item::{ItemIdentifier, ItemSubmission, ItemType, ItemTypeId, OrgId};
use crate::domain::job::{Job, JobId, JobPayload, QueueId};
use crate::domain::routing::{RoutingRule, RoutingRuleId, RoutingRuleVersion, SequenceChange};
use crate::domain::rule::Rule;
use crate::errors::StoreError;
use crate::ingestion::{DeadLetter, DeadLetterSink};
use crate::investigation::ItemInvestigation;
use crate::queue::QueueStore;
use crate::routing::rules::RoutingRuleStore;

pub use crate::audit::InMemoryExecutionLog;
pub use crate::ingestion::object_store::InMemoryObjectStore;

fn locked<T, R>(mutex: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> R {
    match mutex.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

fn unavailable(store: &str) -> StoreError {
    StoreError::Unavailable(format!("{store} unavailable"))
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<(OrgId, QueueId), Vec<Job>>,
    defaults: HashMap<OrgId, QueueId>,
    failing_removals: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryQueueStore {
    pub fn add_queue(&self, org_id: &OrgId, queue_id: QueueId, is_default: bool) {
        locked(&self.state, |state| {
            if is_default {
                state.defaults.insert(org_id.clone(), queue_id.clone());
            }
            state.jobs.entry((org_id.clone(), queue_id)).or_default();
        });
    }

    /// Jobs currently in the queue, across orgs.
    pub fn jobs(&self, queue_id: &QueueId) -> Vec<Job> {
        locked(&self.state, |state| {
            state
                .jobs
                .iter()
                .filter(|((_, queue), _)| queue == queue_id)
                .flat_map(|(_, jobs)| jobs.clone())
                .collect()
        })
    }

    /// Makes the next `count` removals fail as if the store were down.
    pub fn fail_next_removals(&self, count: usize) {
        locked(&self.state, |state| state.failing_removals = count);
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
        payload: JobPayload,
    ) -> Result<Job, StoreError> {
        locked(&self.state, |state| {
            let jobs = state
                .jobs
                .get_mut(&(org_id.clone(), queue_id.clone()))
                .ok_or_else(|| StoreError::NotFound(format!("queue {}", queue_id.0)))?;
            let job = Job::new(org_id.clone(), queue_id.clone(), payload);
            jobs.push(job.clone());
            Ok(job)
        })
    }

    async fn get_jobs(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
        ids: &[JobId],
    ) -> Result<Vec<Job>, StoreError> {
        Ok(locked(&self.state, |state| {
            state
                .jobs
                .get(&(org_id.clone(), queue_id.clone()))
                .map(|jobs| jobs.iter().filter(|job| ids.contains(&job.id)).cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn dequeue(&self, org_id: &OrgId, queue_id: &QueueId) -> Result<Option<Job>, StoreError> {
        Ok(locked(&self.state, |state| {
            let jobs = state.jobs.get_mut(&(org_id.clone(), queue_id.clone()))?;
            let job = jobs.iter_mut().find(|job| job.lock_token.is_none())?;
            job.lock_token = Some(uuid::Uuid::new_v4().to_string());
            Some(job.clone())
        }))
    }

    async fn remove_job(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
        job_id: &JobId,
        lock_token: &str,
    ) -> Result<(), StoreError> {
        locked(&self.state, |state| {
            if state.failing_removals > 0 {
                state.failing_removals -= 1;
                return Err(unavailable("queue store"));
            }
            let jobs = state
                .jobs
                .get_mut(&(org_id.clone(), queue_id.clone()))
                .ok_or_else(|| StoreError::NotFound(format!("queue {}", queue_id.0)))?;
            let index = jobs
                .iter()
                .position(|job| &job.id == job_id)
                .ok_or_else(|| StoreError::NotFound(format!("job {}", job_id.0)))?;
            if jobs[index].lock_token.as_deref() != Some(lock_token) {
                return Err(StoreError::Conflict(format!("job {} is held by another lock", job_id.0)));
            }
            jobs.remove(index);
            Ok(())
        })
    }

    async fn check_queue_exists(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
    ) -> Result<bool, StoreError> {
        Ok(locked(&self.state, |state| {
            state.jobs.contains_key(&(org_id.clone(), queue_id.clone()))
        }))
    }

    async fn get_default_queue_id_for_org(
        &self,
        org_id: &OrgId,
    ) -> Result<Option<QueueId>, StoreError> {
        Ok(locked(&self.state, |state| state.defaults.get(org_id).cloned()))
    }
}

#[derive(Default)]
struct RoutingRuleState {
    rules: Vec<RoutingRule>,
    versions: Vec<RoutingRuleVersion>,
}

#[derive(Clone, Default)]
pub struct InMemoryRoutingRuleStore {
    state: Arc<Mutex<RoutingRuleState>>,
}

impl InMemoryRoutingRuleStore {
    /// Current rules of the org in sequence order.
    pub fn rules(&self, org_id: &OrgId) -> Vec<RoutingRule> {
        locked(&self.state, |state| current_rules(&state.rules, org_id))
    }
}

fn current_rules(rules: &[RoutingRule], org_id: &OrgId) -> Vec<RoutingRule> {
    let mut current: Vec<RoutingRule> =
        rules.iter().filter(|rule| &rule.org_id == org_id).cloned().collect();
    current.sort_by_key(|rule| rule.sequence_number);
    current
}

fn name_taken(rules: &[RoutingRule], candidate: &RoutingRule) -> bool {
    rules.iter().any(|rule| {
        rule.org_id == candidate.org_id && rule.name == candidate.name && rule.id != candidate.id
    })
}

#[async_trait]
impl RoutingRuleStore for InMemoryRoutingRuleStore {
    async fn list_current_rules(&self, org_id: &OrgId) -> Result<Vec<RoutingRule>, StoreError> {
        Ok(self.rules(org_id))
    }

    async fn find_rule(
        &self,
        org_id: &OrgId,
        id: &RoutingRuleId,
    ) -> Result<Option<RoutingRule>, StoreError> {
        Ok(locked(&self.state, |state| {
            state.rules.iter().find(|rule| &rule.org_id == org_id && &rule.id == id).cloned()
        }))
    }

    async fn next_sequence_number(&self, org_id: &OrgId) -> Result<i64, StoreError> {
        Ok(locked(&self.state, |state| {
            state
                .rules
                .iter()
                .filter(|rule| &rule.org_id == org_id)
                .map(|rule| rule.sequence_number)
                .max()
                .unwrap_or(0)
                + 1
        }))
    }

    async fn insert_rule(&self, rule: &RoutingRule) -> Result<(), StoreError> {
        locked(&self.state, |state| {
            if name_taken(&state.rules, rule) {
                return Err(StoreError::UniqueViolation("routing_rules.name".to_owned()));
            }
            state.rules.push(rule.clone());
            state.versions.push(RoutingRuleVersion::of(rule));
            Ok(())
        })
    }

    async fn update_rule(&self, rule: &RoutingRule, new_version: bool) -> Result<(), StoreError> {
        locked(&self.state, |state| {
            if name_taken(&state.rules, rule) {
                return Err(StoreError::UniqueViolation("routing_rules.name".to_owned()));
            }
            let existing = state
                .rules
                .iter_mut()
                .find(|stored| stored.org_id == rule.org_id && stored.id == rule.id)
                .ok_or_else(|| StoreError::NotFound(format!("routing rule {}", rule.id.0)))?;
            *existing = rule.clone();

            if new_version {
                for version in state.versions.iter_mut().filter(|v| v.rule_id == rule.id) {
                    version.is_current = false;
                }
                state.versions.push(RoutingRuleVersion::of(rule));
            }
            Ok(())
        })
    }

    async fn delete_rule(&self, org_id: &OrgId, id: &RoutingRuleId) -> Result<bool, StoreError> {
        Ok(locked(&self.state, |state| {
            let before = state.rules.len();
            state.rules.retain(|rule| !(&rule.org_id == org_id && &rule.id == id));
            state.rules.len() != before
        }))
    }

    async fn apply_sequence_changes(
        &self,
        org_id: &OrgId,
        changes: &[SequenceChange],
    ) -> Result<(), StoreError> {
        locked(&self.state, |state| {
            for rule in state.rules.iter_mut().filter(|rule| &rule.org_id == org_id) {
                if let Some(change) = changes.iter().find(|change| change.rule_id == rule.id) {
                    rule.sequence_number = change.to;
                }
            }
        });
        Ok(())
    }

    async fn list_versions(
        &self,
        org_id: &OrgId,
        id: &RoutingRuleId,
    ) -> Result<Vec<RoutingRuleVersion>, StoreError> {
        let owned = locked(&self.state, |state| {
            state.rules.iter().any(|rule| &rule.org_id == org_id && &rule.id == id)
        });
        if !owned {
            return Ok(Vec::new());
        }
        Ok(locked(&self.state, |state| {
            let mut versions: Vec<RoutingRuleVersion> =
                state.versions.iter().filter(|version| &version.rule_id == id).cloned().collect();
            versions.sort_by(|left, right| right.version.cmp(&left.version));
            versions
        }))
    }
}

#[derive(Default)]
struct CatalogState {
    item_types: Vec<ItemType>,
    actions: Vec<Action>,
    policies: Vec<Policy>,
    rules: Vec<Rule>,
    failing: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl InMemoryCatalog {
    pub fn add_item_type(&self, item_type: ItemType) {
        locked(&self.state, |state| state.item_types.push(item_type));
    }

    pub fn add_action(&self, action: Action) {
        locked(&self.state, |state| state.actions.push(action));
    }

    pub fn add_policy(&self, policy: Policy) {
        locked(&self.state, |state| state.policies.push(policy));
    }

    pub fn add_rule(&self, rule: Rule) {
        locked(&self.state, |state| state.rules.push(rule));
    }

    pub fn set_failing(&self, failing: bool) {
        locked(&self.state, |state| state.failing = failing);
    }

    fn read<R>(&self, f: impl FnOnce(&CatalogState) -> R) -> Result<R, StoreError> {
        locked(&self.state, |state| {
            if state.failing {
                return Err(unavailable("catalog"));
            }
            Ok(f(state))
        })
    }
}

#[async_trait]
impl ModerationCatalog for InMemoryCatalog {
    async fn get_item_type(
        &self,
        org_id: &OrgId,
        item_type_id: &ItemTypeId,
    ) -> Result<Option<ItemType>, StoreError> {
        self.read(|state| {
            state
                .item_types
                .iter()
                .find(|item_type| &item_type.org_id == org_id && &item_type.id == item_type_id)
                .cloned()
        })
    }

    async fn get_actions(
        &self,
        org_id: &OrgId,
        ids: &[ActionId],
    ) -> Result<Vec<Action>, StoreError> {
        self.read(|state| {
            state
                .actions
                .iter()
                .filter(|action| &action.org_id == org_id && ids.contains(&action.id))
                .cloned()
                .collect()
        })
    }

    async fn get_policies(
        &self,
        org_id: &OrgId,
        ids: &[PolicyId],
    ) -> Result<Vec<Policy>, StoreError> {
        self.read(|state| {
            state
                .policies
                .iter()
                .filter(|policy| &policy.org_id == org_id && ids.contains(&policy.id))
                .cloned()
                .collect()
        })
    }

    async fn get_enabled_rules(
        &self,
        org_id: &OrgId,
        item_type_id: &ItemTypeId,
    ) -> Result<Vec<Rule>, StoreError> {
        self.read(|state| {
            state
                .rules
                .iter()
                .filter(|rule| {
                    &rule.org_id == org_id
                        && rule.status.is_enabled()
                        && rule.item_type_ids.contains(item_type_id)
                })
                .cloned()
                .collect()
        })
    }
}

#[derive(Default)]
struct InvestigationState {
    items: Vec<ItemSubmission>,
    failing_inserts: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryInvestigation {
    state: Arc<Mutex<InvestigationState>>,
}

impl InMemoryInvestigation {
    pub fn items(&self) -> Vec<ItemSubmission> {
        locked(&self.state, |state| state.items.clone())
    }

    pub fn fail_next_inserts(&self, count: usize) {
        locked(&self.state, |state| state.failing_inserts = count);
    }
}

#[async_trait]
impl ItemInvestigation for InMemoryInvestigation {
    async fn insert_item(&self, item: &ItemSubmission) -> Result<(), StoreError> {
        locked(&self.state, |state| {
            if state.failing_inserts > 0 {
                state.failing_inserts -= 1;
                return Err(unavailable("investigation store"));
            }
            if !state.items.iter().any(|stored| stored.submission_id == item.submission_id) {
                state.items.push(item.clone());
            }
            Ok(())
        })
    }

    async fn get_item(
        &self,
        org_id: &OrgId,
        item: &ItemIdentifier,
    ) -> Result<Option<ItemSubmission>, StoreError> {
        Ok(locked(&self.state, |state| {
            state
                .items
                .iter()
                .filter(|stored| &stored.org_id == org_id && &stored.item == item)
                .max_by_key(|stored| stored.submission_time)
                .cloned()
        }))
    }

    async fn get_thread_items(
        &self,
        org_id: &OrgId,
        thread: &ItemIdentifier,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ItemSubmission>, StoreError> {
        Ok(locked(&self.state, |state| {
            let mut latest: HashMap<&ItemIdentifier, &ItemSubmission> = HashMap::new();
            for stored in state.items.iter().filter(|stored| {
                &stored.org_id == org_id
                    && stored.thread.as_ref() == Some(thread)
                    && stored.created_at.unwrap_or(stored.submission_time) <= before
            }) {
                let newer = latest
                    .get(&stored.item)
                    .map_or(true, |seen| seen.submission_time < stored.submission_time);
                if newer {
                    latest.insert(&stored.item, stored);
                }
            }
            let mut items: Vec<ItemSubmission> = latest.into_values().cloned().collect();
            items.sort_by_key(|item| std::cmp::Reverse(item.created_at.unwrap_or(item.submission_time)));
            items.truncate(limit);
            items
        }))
    }
}

#[derive(Default)]
struct DecisionState {
    decisions: Vec<Decision>,
    failing: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryDecisionLog {
    state: Arc<Mutex<DecisionState>>,
}

impl InMemoryDecisionLog {
    pub fn decisions(&self) -> Vec<Decision> {
        locked(&self.state, |state| state.decisions.clone())
    }

    pub fn set_failing(&self, failing: bool) {
        locked(&self.state, |state| state.failing = failing);
    }
}

#[async_trait]
impl DecisionLog for InMemoryDecisionLog {
    async fn log_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        locked(&self.state, |state| {
            if state.failing {
                return Err(unavailable("decision log"));
            }
            if state.decisions.iter().any(|stored| stored.id == decision.id) {
                return Err(StoreError::UniqueViolation("decisions.id".to_owned()));
            }
            state.decisions.push(decision.clone());
            Ok(())
        })
    }

    async fn get_decision(
        &self,
        org_id: &OrgId,
        id: &JobId,
    ) -> Result<Option<Decision>, StoreError> {
        Ok(locked(&self.state, |state| {
            state
                .decisions
                .iter()
                .find(|stored| &stored.org_id == org_id && &stored.id == id)
                .cloned()
        }))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetters {
    pub fn letters(&self) -> Vec<DeadLetter> {
        locked(&self.letters, |letters| letters.clone())
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetters {
    async fn write(&self, letter: DeadLetter) -> Result<(), StoreError> {
        locked(&self.letters, |letters| {
            let recorded = letters.iter().any(|existing| {
                existing.topic == letter.topic
                    && existing.partition == letter.partition
                    && existing.offset == letter.offset
            });
            if !recorded {
                letters.push(letter);
            }
        });
        Ok(())
    }
}

#[derive(Default)]
struct StrikeState {
    totals: HashMap<(OrgId, ItemIdentifier), u32>,
    thresholds: Vec<StrikeThreshold>,
    failing: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryStrikeStore {
    state: Arc<Mutex<StrikeState>>,
}

impl InMemoryStrikeStore {
    pub fn add_threshold(&self, threshold: StrikeThreshold) {
        locked(&self.state, |state| state.thresholds.push(threshold));
    }

    pub fn total(&self, org_id: &OrgId, user: &ItemIdentifier) -> u32 {
        locked(&self.state, |state| {
            state.totals.get(&(org_id.clone(), user.clone())).copied().unwrap_or(0)
        })
    }

    pub fn set_failing(&self, failing: bool) {
        locked(&self.state, |state| state.failing = failing);
    }
}

#[async_trait]
impl StrikeStore for InMemoryStrikeStore {
    async fn record_strikes(
        &self,
        org_id: &OrgId,
        user: &ItemIdentifier,
        _policy_id: &PolicyId,
        count: u32,
    ) -> Result<u32, StoreError> {
        locked(&self.state, |state| {
            if state.failing {
                return Err(unavailable("strike store"));
            }
            let total = state.totals.entry((org_id.clone(), user.clone())).or_insert(0);
            *total += count;
            Ok(*total)
        })
    }

    async fn get_thresholds(&self, org_id: &OrgId) -> Result<Vec<StrikeThreshold>, StoreError> {
        locked(&self.state, |state| {
            if state.failing {
                return Err(unavailable("strike store"));
            }
            Ok(state
                .thresholds
                .iter()
                .filter(|threshold| &threshold.org_id == org_id)
                .cloned()
                .collect())
        })
    }
}
