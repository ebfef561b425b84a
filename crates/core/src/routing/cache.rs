use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::{CacheDirectives, Cached, ConsumerDirectives, Producer};
use crate::domain::item::OrgId;
use crate::domain::routing::RoutingRule;
use crate::errors::StoreError;
use crate::routing::rules::RoutingRuleStore;

/// Per-org rule lists, shared read-mostly by every worker in the process.
///
/// Writers never invalidate it; readers see changes once the cached list goes stale.
#[derive(Clone)]
pub struct RoutingRuleCache {
    cached: Cached<OrgId, Arc<Vec<RoutingRule>>>,
}

struct CurrentRules {
    store: Arc<dyn RoutingRuleStore>,
}

#[async_trait]
impl Producer<OrgId, Arc<Vec<RoutingRule>>> for CurrentRules {
    async fn produce(&self, org_id: &OrgId) -> Result<Arc<Vec<RoutingRule>>, StoreError> {
        let mut rules = self.store.list_current_rules(org_id).await?;
        rules.sort_by_key(|rule| rule.sequence_number);
        Ok(Arc::new(rules))
    }
}

impl RoutingRuleCache {
    pub fn new(store: Arc<dyn RoutingRuleStore>, directives: CacheDirectives) -> Self {
        Self { cached: Cached::new(Arc::new(CurrentRules { store }), directives) }
    }

    pub async fn get_rules(
        &self,
        org_id: &OrgId,
        consumer: ConsumerDirectives,
    ) -> Result<Arc<Vec<RoutingRule>>, StoreError> {
        self.cached.get(org_id, consumer).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::RoutingRuleCache;
    use crate::cache::{CacheDirectives, ConsumerDirectives, StaleTolerance};
    use crate::domain::item::ItemTypeId;
    use crate::domain::job::QueueId;
    use crate::domain::routing::{RoutingRule, RoutingRuleId, RoutingRuleStatus};
    use crate::memory::InMemoryRoutingRuleStore;
    use crate::routing::rules::RoutingRuleStore;
    use crate::testing::{org, text_contains};

    fn rule(id: &str, sequence: i64) -> RoutingRule {
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

    #[tokio::test(start_paused = true)]
    async fn writes_become_visible_once_the_cached_list_is_stale() {
        let store = InMemoryRoutingRuleStore::default();
        store.insert_rule(&rule("a", 1)).await.expect("insert a");
        let cache = RoutingRuleCache::new(
            Arc::new(store.clone()),
            CacheDirectives {
                fresh_until: Duration::from_secs(15),
                max_stale: StaleTolerance::from_secs([0, 0, 0]),
            },
        );

        assert_eq!(cache.get_rules(&org(), ConsumerDirectives::default()).await.expect("load").len(), 1);

        store.insert_rule(&rule("b", 2)).await.expect("insert b");
        assert_eq!(cache.get_rules(&org(), ConsumerDirectives::default()).await.expect("cached").len(), 1);

        tokio::time::advance(Duration::from_secs(16)).await;
        let refreshed = cache.get_rules(&org(), ConsumerDirectives::default()).await.expect("refresh");
        let ids: Vec<&str> = refreshed.iter().map(|rule| rule.id.0.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
