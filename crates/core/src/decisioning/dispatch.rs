//! Downstream effects of a recorded decision.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::actions::{ActionPublisher, PublishError};
use crate::catalog::ModerationCatalog;
use crate::decisioning::{DecisionActor, DecisionListener};
use crate::domain::action::{ActionId, ActionTarget, PolicyId, PublishContext, TriggeredAction};
use crate::domain::correlation::{CorrelationId, CorrelationSource};
use crate::domain::decision::{Decision, DecisionComponent};
use crate::domain::item::{ItemIdentifier, ItemTypeId, ItemTypeKind};
use crate::domain::job::{EnqueueSource, JobKind, QueueId};
use crate::errors::StoreError;
use crate::queue::QueueStore;
use crate::routing::{JobRouter, RoutingError};

/// Hooks for decision outcomes that leave this system: appeal bookkeeping, external
/// reports and reviewer notifications.
#[async_trait]
pub trait ReviewCallbacks: Send + Sync {
    async fn on_ignore(&self, decision: &Decision) -> Result<(), StoreError>;

    async fn on_appeal_resolved(
        &self,
        decision: &Decision,
        appeal_id: &str,
        accepted: bool,
    ) -> Result<(), StoreError>;

    async fn on_external_report(
        &self,
        decision: &Decision,
        category: &str,
        high_priority: bool,
    ) -> Result<(), StoreError>;
}

/// Callbacks that only emit events.
pub struct LoggingReviewCallbacks;

#[async_trait]
impl ReviewCallbacks for LoggingReviewCallbacks {
    async fn on_ignore(&self, decision: &Decision) -> Result<(), StoreError> {
        info!(
            event_name = "decisioning.review.ignored",
            org_id = %decision.org_id.0,
            job_id = %decision.id.0,
            "job ignored"
        );
        Ok(())
    }

    async fn on_appeal_resolved(
        &self,
        decision: &Decision,
        appeal_id: &str,
        accepted: bool,
    ) -> Result<(), StoreError> {
        info!(
            event_name = "decisioning.appeal.resolved",
            org_id = %decision.org_id.0,
            job_id = %decision.id.0,
            appeal_id,
            accepted,
            "appeal resolved"
        );
        Ok(())
    }

    async fn on_external_report(
        &self,
        decision: &Decision,
        category: &str,
        high_priority: bool,
    ) -> Result<(), StoreError> {
        info!(
            event_name = "decisioning.external_report.submitted",
            org_id = %decision.org_id.0,
            job_id = %decision.id.0,
            category,
            high_priority,
            "external report submitted"
        );
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("decision dispatch lookup failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

pub struct DecisionDispatcher {
    catalog: Arc<dyn ModerationCatalog>,
    publisher: ActionPublisher,
    router: Arc<JobRouter>,
    queues: Arc<dyn QueueStore>,
    callbacks: Arc<dyn ReviewCallbacks>,
}

impl DecisionDispatcher {
    pub fn new(
        catalog: Arc<dyn ModerationCatalog>,
        publisher: ActionPublisher,
        router: Arc<JobRouter>,
        queues: Arc<dyn QueueStore>,
        callbacks: Arc<dyn ReviewCallbacks>,
    ) -> Self {
        Self { catalog, publisher, router, queues, callbacks }
    }

    async fn dispatch_component(
        &self,
        decision: &Decision,
        component: &DecisionComponent,
        actor: &DecisionActor,
        correlation_id: &CorrelationId,
    ) -> Result<(), DispatchError> {
        match component {
            DecisionComponent::Ignore => self.callbacks.on_ignore(decision).await?,
            DecisionComponent::AcceptAppeal { appeal_id } => {
                self.callbacks.on_appeal_resolved(decision, appeal_id, true).await?
            }
            DecisionComponent::RejectAppeal { appeal_id } => {
                self.callbacks.on_appeal_resolved(decision, appeal_id, false).await?
            }
            DecisionComponent::SubmitExternalReport { category, escalate_to_high_priority } => {
                self.callbacks
                    .on_external_report(decision, category, *escalate_to_high_priority)
                    .await?
            }
            DecisionComponent::CustomAction { action_ids, policy_ids, item_ids, item_type_id } => {
                self.publish(
                    decision,
                    action_ids,
                    policy_ids,
                    item_ids,
                    item_type_id,
                    actor,
                    correlation_id,
                )
                .await?
            }
            DecisionComponent::TransformAndRequeue {
                new_job_kind,
                original_queue_id,
                new_queue_id,
            } => {
                self.requeue(decision, *new_job_kind, original_queue_id, new_queue_id.as_ref(), correlation_id)
                    .await?
            }
            DecisionComponent::AutomaticClose { .. } => {}
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        decision: &Decision,
        action_ids: &[ActionId],
        policy_ids: &[PolicyId],
        item_ids: &[String],
        item_type_id: &ItemTypeId,
        actor: &DecisionActor,
        correlation_id: &CorrelationId,
    ) -> Result<(), DispatchError> {
        let org_id = &decision.org_id;
        let actions = self.catalog.get_actions(org_id, action_ids).await?;
        if actions.is_empty() {
            return Ok(());
        }
        let policies = self.catalog.get_policies(org_id, policy_ids).await?;

        for target in self.targets(decision, item_ids, item_type_id).await? {
            let triggered = actions
                .iter()
                .map(|action| TriggeredAction::manual(action.clone(), policies.clone()))
                .collect();
            self.publisher
                .publish_actions(
                    triggered,
                    PublishContext {
                        org_id: org_id.clone(),
                        correlation_id: correlation_id.clone(),
                        target,
                        actor_id: actor.reviewer_id.clone(),
                        actor_email: actor.reviewer_email.clone(),
                        job_id: Some(decision.id.clone()),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// No explicit items means the job's own item.
    async fn targets(
        &self,
        decision: &Decision,
        item_ids: &[String],
        item_type_id: &ItemTypeId,
    ) -> Result<Vec<ActionTarget>, DispatchError> {
        let job_item = &decision.job_payload.item;
        if item_ids.is_empty() {
            return Ok(vec![ActionTarget::Submission(Box::new(job_item.clone()))]);
        }

        let kind = self
            .catalog
            .get_item_type(&decision.org_id, item_type_id)
            .await?
            .map(|item_type| item_type.kind)
            .unwrap_or(ItemTypeKind::Content);

        Ok(item_ids
            .iter()
            .map(|id| {
                let item = ItemIdentifier { id: id.clone(), type_id: item_type_id.clone() };
                if item == job_item.item {
                    ActionTarget::Submission(Box::new(job_item.clone()))
                } else {
                    ActionTarget::Identifier { item, kind }
                }
            })
            .collect())
    }

    async fn requeue(
        &self,
        decision: &Decision,
        new_job_kind: JobKind,
        original_queue_id: &QueueId,
        new_queue_id: Option<&QueueId>,
        correlation_id: &CorrelationId,
    ) -> Result<(), DispatchError> {
        let mut payload = decision.job_payload.clone();
        payload.kind = new_job_kind;
        payload.enqueue_source = EnqueueSource::Requeue;

        let job = match new_queue_id {
            Some(queue_id) => self.queues.enqueue(&decision.org_id, queue_id, payload).await?,
            None => {
                let policy_ids = payload.policy_ids.clone();
                self.router.enqueue(payload, &policy_ids, correlation_id).await?
            }
        };
        info!(
            event_name = "decisioning.job.requeued",
            org_id = %decision.org_id.0,
            job_id = %decision.id.0,
            new_job_id = %job.id.0,
            from_queue = %original_queue_id.0,
            to_queue = %job.queue_id.0,
            kind = new_job_kind.as_str(),
            "job transformed and requeued"
        );
        Ok(())
    }
}

#[async_trait]
impl DecisionListener for DecisionDispatcher {
    /// Every component and related action is attempted; the first failure is returned.
    async fn on_decision(
        &self,
        decision: Decision,
        actor: DecisionActor,
    ) -> Result<(), DispatchError> {
        let correlation_id = CorrelationId::new(CorrelationSource::ReviewDecision, decision.id.0.clone());
        let mut first_error = None;

        for component in &decision.components {
            if let Err(error) =
                self.dispatch_component(&decision, component, &actor, &correlation_id).await
            {
                warn!(
                    event_name = "decisioning.dispatch.component_failed",
                    correlation_id = %correlation_id,
                    component = component.as_str(),
                    error = %error,
                    "decision component failed"
                );
                first_error.get_or_insert(error);
            }
        }

        for related in &decision.related_actions {
            let outcome = self
                .publish(
                    &decision,
                    &related.action_ids,
                    &related.policy_ids,
                    &related.item_ids,
                    &related.item_type_id,
                    &actor,
                    &correlation_id,
                )
                .await;
            if let Err(error) = outcome {
                warn!(
                    event_name = "decisioning.dispatch.related_failed",
                    correlation_id = %correlation_id,
                    error = %error,
                    "related action failed"
                );
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
