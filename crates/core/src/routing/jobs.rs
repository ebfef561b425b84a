use std::sync::Arc;

use tracing::error;

use crate::cache::ConsumerDirectives;
use crate::domain::action::PolicyId;
use crate::domain::correlation::CorrelationId;
use crate::domain::job::{Job, JobKind, JobPayload, QueueId};
use crate::queue::QueueStore;
use crate::routing::{RoutingEngine, RoutingError, RoutingRuleCache};

/// Picks the queue a new job belongs in.
pub struct JobRouter {
    cache: RoutingRuleCache,
    engine: RoutingEngine,
    queues: Arc<dyn QueueStore>,
}

impl JobRouter {
    pub fn new(cache: RoutingRuleCache, engine: RoutingEngine, queues: Arc<dyn QueueStore>) -> Self {
        Self { cache, engine, queues }
    }

    /// Destination of the first matching rule, otherwise the org's default queue.
    /// Appeal jobs are routed by appeal rules only, every other job by the remaining rules.
    pub async fn queue_for_job(
        &self,
        payload: &JobPayload,
        policy_ids: &[PolicyId],
        correlation_id: &CorrelationId,
    ) -> Result<QueueId, RoutingError> {
        let org_id = &payload.item.org_id;
        let rules = self
            .cache
            .get_rules(org_id, ConsumerDirectives::default())
            .await
            .map_err(RoutingError::Rules)?;

        let appeal = payload.kind == JobKind::Appeal;
        let candidates: Vec<_> =
            rules.iter().filter(|rule| rule.is_appeals_rule == appeal).cloned().collect();

        if let Some(queue_id) =
            self.engine.route(&candidates, &payload.item, policy_ids, correlation_id).await?
        {
            return Ok(queue_id);
        }

        match self.queues.get_default_queue_id_for_org(org_id).await {
            Ok(Some(queue_id)) => Ok(queue_id),
            Ok(None) => {
                error!(
                    event_name = "routing.default_queue.missing",
                    correlation_id = %correlation_id,
                    org_id = %org_id.0,
                    "no routing rule matched and the org has no default queue"
                );
                Err(RoutingError::NoDefaultQueue { org_id: org_id.0.clone() })
            }
            Err(source) => {
                error!(
                    event_name = "routing.default_queue.lookup_failed",
                    correlation_id = %correlation_id,
                    org_id = %org_id.0,
                    error = %source,
                    "default queue lookup failed"
                );
                Err(RoutingError::DefaultQueueLookup { org_id: org_id.0.clone(), source })
            }
        }
    }

    /// Routes the payload and enqueues it.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        policy_ids: &[PolicyId],
        correlation_id: &CorrelationId,
    ) -> Result<Job, RoutingError> {
        let queue_id = self.queue_for_job(&payload, policy_ids, correlation_id).await?;
        let org_id = payload.item.org_id.clone();
        self.queues.enqueue(&org_id, &queue_id, payload).await.map_err(RoutingError::Enqueue)
    }
}
