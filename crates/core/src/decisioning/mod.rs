//! Records review decisions and removes the decided job from its queue.
//!
//! The decision log and the queue store cannot share a transaction, so the decision is
//! always made durable first. A job can therefore never disappear without a decision. The
//! unique job id on the decision log turns retried writes into an "already logged" signal:
//!
//! | decision log      | queue removal | result                         |
//! |-------------------|---------------|--------------------------------|
//! | written           | ok            | success                        |
//! | written           | failed        | `DecisioningFailed` (retry)    |
//! | already logged    | ok            | `AlreadySubmitted`             |
//! | already logged    | failed        | `DecisioningFailed` (retry)    |
//! | any other failure | not attempted | `Store` (retry)                |

pub mod dispatch;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::catalog::ModerationCatalog;
use crate::domain::action::ActionId;
use crate::domain::decision::{Decision, DecisionComponent, DecisionVerdict, RelatedAction};
use crate::domain::item::OrgId;
use crate::domain::job::{JobId, QueueId};
use crate::errors::{Classify, ErrorClass, StoreError};
use crate::queue::QueueStore;

pub use dispatch::{DecisionDispatcher, DispatchError, LoggingReviewCallbacks, ReviewCallbacks};

/// Append-only decision store, unique by job id.
#[async_trait]
pub trait DecisionLog: Send + Sync {
    /// A second write for the same job id fails with `StoreError::UniqueViolation`.
    async fn log_decision(&self, decision: &Decision) -> Result<(), StoreError>;

    async fn get_decision(&self, org_id: &OrgId, id: &JobId)
        -> Result<Option<Decision>, StoreError>;
}

/// Who made a decision, as passed on to downstream dispatch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecisionActor {
    pub reviewer_id: Option<String>,
    pub reviewer_email: Option<String>,
}

/// Runs after a new, non-automatic decision has been recorded.
#[async_trait]
pub trait DecisionListener: Send + Sync {
    async fn on_decision(&self, decision: Decision, actor: DecisionActor)
        -> Result<(), DispatchError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubmitDecision {
    pub org_id: OrgId,
    pub job_id: JobId,
    pub queue_id: QueueId,
    pub lock_token: String,
    pub verdict: DecisionVerdict,
    pub actor: DecisionActor,
    pub related_actions: Vec<RelatedAction>,
    pub reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("a decision for job `{job_id}` was already submitted")]
    AlreadySubmitted { job_id: String },
    #[error("job `{job_id}` is locked by another reviewer")]
    LockMismatch { job_id: String },
    #[error("none of the referenced actions exist")]
    ActionNotFound,
    #[error("invalid decision: {0}")]
    Invalid(String),
    #[error("decisioning failed for job `{job_id}`; the request can be retried")]
    DecisioningFailed {
        job_id: String,
        #[source]
        source: StoreError,
    },
    #[error("decision store failure: {0}")]
    Store(#[source] StoreError),
}

impl Classify for DecisionError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::AlreadySubmitted { .. } => ErrorClass::Idempotent,
            Self::LockMismatch { .. } | Self::ActionNotFound | Self::Invalid(_) => {
                ErrorClass::Validation
            }
            Self::DecisioningFailed { .. } | Self::Store(_) => ErrorClass::Transient,
        }
    }
}

pub struct JobDecisioning {
    queues: Arc<dyn QueueStore>,
    decisions: Arc<dyn DecisionLog>,
    catalog: Arc<dyn ModerationCatalog>,
    listener: Arc<dyn DecisionListener>,
}

impl JobDecisioning {
    pub fn new(
        queues: Arc<dyn QueueStore>,
        decisions: Arc<dyn DecisionLog>,
        catalog: Arc<dyn ModerationCatalog>,
        listener: Arc<dyn DecisionListener>,
    ) -> Self {
        Self { queues, decisions, catalog, listener }
    }

    pub async fn submit_decision(&self, request: SubmitDecision) -> Result<Decision, DecisionError> {
        let SubmitDecision {
            org_id,
            job_id,
            queue_id,
            lock_token,
            verdict,
            actor,
            related_actions,
            reason,
        } = request;

        let job = self
            .queues
            .get_jobs(&org_id, &queue_id, std::slice::from_ref(&job_id))
            .await
            .map_err(DecisionError::Store)?
            .into_iter()
            .next();
        let Some(job) = job else {
            info!(
                event_name = "decisioning.job.already_decided",
                org_id = %org_id.0,
                queue_id = %queue_id.0,
                job_id = %job_id.0,
                "job is no longer queued"
            );
            return Err(DecisionError::AlreadySubmitted { job_id: job_id.0 });
        };
        if job.lock_token.as_deref() != Some(lock_token.as_str()) {
            return Err(DecisionError::LockMismatch { job_id: job_id.0 });
        }

        let components = verdict.into_components();
        if components.is_empty() {
            return Err(DecisionError::Invalid("a decision needs at least one component".into()));
        }
        self.ensure_actions_exist(&org_id, &components, &related_actions).await?;

        let decision = Decision {
            id: job.id.clone(),
            org_id: org_id.clone(),
            queue_id: queue_id.clone(),
            reviewer_id: actor.reviewer_id.clone(),
            components,
            related_actions,
            job_payload: job.payload,
            reason,
            created_at: Utc::now(),
        };

        let newly_logged = match self.decisions.log_decision(&decision).await {
            Ok(()) => true,
            Err(StoreError::UniqueViolation(_)) => false,
            Err(source) => {
                error!(
                    event_name = "decisioning.decision.log_failed",
                    org_id = %org_id.0,
                    job_id = %job_id.0,
                    error = %source,
                    "decision could not be recorded; job left in queue"
                );
                return Err(DecisionError::Store(source));
            }
        };

        if let Err(source) = self.queues.remove_job(&org_id, &queue_id, &job_id, &lock_token).await
        {
            warn!(
                event_name = "decisioning.job.remove_failed",
                org_id = %org_id.0,
                queue_id = %queue_id.0,
                job_id = %job_id.0,
                decision_replayed = !newly_logged,
                error = %source,
                "decision is durable but the job is still queued"
            );
            return Err(DecisionError::DecisioningFailed { job_id: job_id.0, source });
        }

        if !newly_logged {
            info!(
                event_name = "decisioning.job.recovered",
                org_id = %org_id.0,
                job_id = %job_id.0,
                "removed job whose decision was recorded by an earlier attempt"
            );
            return Err(DecisionError::AlreadySubmitted { job_id: job_id.0 });
        }

        info!(
            event_name = "decisioning.decision.recorded",
            org_id = %org_id.0,
            queue_id = %queue_id.0,
            job_id = %job_id.0,
            components = decision.components.len(),
            automatic = decision.is_automatic_close(),
            "decision recorded"
        );

        if !decision.is_automatic_close() {
            self.spawn_dispatch(decision.clone(), actor);
        }
        Ok(decision)
    }

    async fn ensure_actions_exist(
        &self,
        org_id: &OrgId,
        components: &[DecisionComponent],
        related_actions: &[RelatedAction],
    ) -> Result<(), DecisionError> {
        let mut action_ids: Vec<ActionId> = components
            .iter()
            .flat_map(|component| component.action_ids().iter().cloned())
            .chain(related_actions.iter().flat_map(|related| related.action_ids.iter().cloned()))
            .collect();
        action_ids.sort();
        action_ids.dedup();
        if action_ids.is_empty() {
            return Ok(());
        }

        let resolved =
            self.catalog.get_actions(org_id, &action_ids).await.map_err(DecisionError::Store)?;
        if resolved.is_empty() {
            return Err(DecisionError::ActionNotFound);
        }
        Ok(())
    }

    fn spawn_dispatch(&self, decision: Decision, actor: DecisionActor) {
        let listener = Arc::clone(&self.listener);
        tokio::spawn(async move {
            let job_id = decision.id.0.clone();
            let org_id = decision.org_id.0.clone();
            if let Err(error) = listener.on_decision(decision, actor).await {
                error!(
                    event_name = "decisioning.dispatch.failed",
                    org_id = %org_id,
                    job_id = %job_id,
                    error = %error,
                    "post-decision dispatch failed"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{
        DecisionActor, DecisionError, DecisionListener, DispatchError, JobDecisioning,
        SubmitDecision,
    };
    use crate::domain::action::{Action, ActionId, ActionKind, PolicyId};
    use crate::domain::decision::{
        AutomaticCloseReason, Decision, DecisionComponent, DecisionVerdict,
    };
    use crate::domain::item::ItemTypeId;
    use crate::domain::job::{EnqueueSource, Job, JobPayload, QueueId};
    use crate::errors::{Classify, ErrorClass};
    use crate::memory::{InMemoryCatalog, InMemoryDecisionLog, InMemoryQueueStore};
    use crate::queue::QueueStore;
    use crate::testing::{org, submission};

    struct ChannelListener(mpsc::UnboundedSender<Decision>);

    #[async_trait]
    impl DecisionListener for ChannelListener {
        async fn on_decision(
            &self,
            decision: Decision,
            _actor: DecisionActor,
        ) -> Result<(), DispatchError> {
            let _ = self.0.send(decision);
            Ok(())
        }
    }

    struct Fixture {
        decisioning: JobDecisioning,
        queues: InMemoryQueueStore,
        decisions: InMemoryDecisionLog,
        dispatched: mpsc::UnboundedReceiver<Decision>,
        job: Job,
    }

    fn review_queue() -> QueueId {
        QueueId("review".to_owned())
    }

    async fn fixture() -> Fixture {
        let queues = InMemoryQueueStore::default();
        queues.add_queue(&org(), review_queue(), true);
        queues
            .enqueue(
                &org(),
                &review_queue(),
                JobPayload::review(
                    submission("post-1", "post", json!({ "body": "x" })),
                    EnqueueSource::RuleExecution,
                ),
            )
            .await
            .expect("enqueue");
        let job = queues.dequeue(&org(), &review_queue()).await.expect("dequeue").expect("job");

        let catalog = InMemoryCatalog::default();
        catalog.add_action(Action {
            id: ActionId("remove".to_owned()),
            org_id: org(),
            name: "Remove".to_owned(),
            kind: ActionKind::EnqueueToReview,
            apply_user_strikes: false,
        });
        let decisions = InMemoryDecisionLog::default();
        let (sender, dispatched) = mpsc::unbounded_channel();
        let decisioning = JobDecisioning::new(
            Arc::new(queues.clone()),
            Arc::new(decisions.clone()),
            Arc::new(catalog),
            Arc::new(ChannelListener(sender)),
        );
        Fixture { decisioning, queues, decisions, dispatched, job }
    }

    fn request(job: &Job, verdict: DecisionVerdict) -> SubmitDecision {
        SubmitDecision {
            org_id: org(),
            job_id: job.id.clone(),
            queue_id: review_queue(),
            lock_token: job.lock_token.clone().unwrap_or_default(),
            verdict,
            actor: DecisionActor { reviewer_id: Some("rev-1".to_owned()), reviewer_email: None },
            related_actions: Vec::new(),
            reason: None,
        }
    }

    fn custom_action(action: &str) -> DecisionVerdict {
        DecisionVerdict::Reviewed(vec![DecisionComponent::CustomAction {
            action_ids: vec![ActionId(action.to_owned())],
            policy_ids: vec![PolicyId("p-1".to_owned())],
            item_ids: Vec::new(),
            item_type_id: ItemTypeId("post".to_owned()),
        }])
    }

    #[tokio::test]
    async fn second_submission_is_already_submitted_with_one_decision_row() {
        let mut fixture = fixture().await;
        let job = fixture.job.clone();

        let decision = fixture
            .decisioning
            .submit_decision(request(&job, DecisionVerdict::Reviewed(vec![DecisionComponent::Ignore])))
            .await
            .expect("first submission");
        assert_eq!(decision.id, job.id);
        assert!(fixture.queues.jobs(&review_queue()).is_empty());

        let error = fixture
            .decisioning
            .submit_decision(request(&job, DecisionVerdict::Reviewed(vec![DecisionComponent::Ignore])))
            .await
            .expect_err("second submission");
        assert!(matches!(error, DecisionError::AlreadySubmitted { .. }));
        assert_eq!(error.class(), ErrorClass::Idempotent);
        assert_eq!(fixture.decisions.decisions().len(), 1);

        let dispatched = fixture.dispatched.recv().await.expect("dispatched once");
        assert_eq!(dispatched.id, job.id);
    }

    #[tokio::test]
    async fn removal_failure_is_retryable_and_retry_does_not_duplicate() {
        let mut fixture = fixture().await;
        let job = fixture.job.clone();
        fixture.queues.fail_next_removals(1);

        let error = fixture
            .decisioning
            .submit_decision(request(&job, custom_action("remove")))
            .await
            .expect_err("removal fails");
        assert!(matches!(error, DecisionError::DecisioningFailed { .. }));
        assert!(error.class().is_retryable());
        assert_eq!(fixture.decisions.decisions().len(), 1);
        assert_eq!(fixture.queues.jobs(&review_queue()).len(), 1);

        let retry = fixture
            .decisioning
            .submit_decision(request(&job, custom_action("remove")))
            .await
            .expect_err("retry replays");
        assert!(matches!(retry, DecisionError::AlreadySubmitted { .. }));
        assert!(fixture.queues.jobs(&review_queue()).is_empty());
        assert_eq!(fixture.decisions.decisions().len(), 1);

        let dispatched = fixture.dispatched.recv().await.expect("first write dispatched");
        assert_eq!(dispatched.id, job.id);
        assert!(fixture.dispatched.try_recv().is_err(), "replay must not dispatch again");
    }

    #[tokio::test]
    async fn replayed_decision_with_failing_removal_is_still_retryable() {
        let fixture = fixture().await;
        let job = fixture.job.clone();
        fixture.queues.fail_next_removals(2);

        let first = fixture.decisioning.submit_decision(request(&job, custom_action("remove"))).await;
        let second = fixture.decisioning.submit_decision(request(&job, custom_action("remove"))).await;

        assert!(matches!(first, Err(DecisionError::DecisioningFailed { .. })));
        assert!(matches!(second, Err(DecisionError::DecisioningFailed { .. })));
        assert_eq!(fixture.decisions.decisions().len(), 1);
    }

    #[tokio::test]
    async fn decision_log_failure_leaves_the_job_queued() {
        let fixture = fixture().await;
        let job = fixture.job.clone();
        fixture.decisions.set_failing(true);

        let error = fixture
            .decisioning
            .submit_decision(request(&job, custom_action("remove")))
            .await
            .expect_err("log down");

        assert!(matches!(error, DecisionError::Store(_)));
        assert!(error.class().is_retryable());
        assert_eq!(fixture.queues.jobs(&review_queue()).len(), 1);
    }

    #[tokio::test]
    async fn unknown_actions_are_rejected_before_any_write() {
        let fixture = fixture().await;
        let job = fixture.job.clone();

        let error = fixture
            .decisioning
            .submit_decision(request(&job, custom_action("missing")))
            .await
            .expect_err("unknown action");

        assert!(matches!(error, DecisionError::ActionNotFound));
        assert!(fixture.decisions.decisions().is_empty());
        assert_eq!(fixture.queues.jobs(&review_queue()).len(), 1);
    }

    #[tokio::test]
    async fn foreign_lock_tokens_are_rejected() {
        let fixture = fixture().await;
        let mut foreign = request(&fixture.job, custom_action("remove"));
        foreign.lock_token = "someone-else".to_owned();

        let error = fixture.decisioning.submit_decision(foreign).await.expect_err("lock");

        assert!(matches!(error, DecisionError::LockMismatch { .. }));
        assert!(fixture.decisions.decisions().is_empty());
    }

    #[tokio::test]
    async fn automatic_close_is_recorded_without_dispatch() {
        let mut fixture = fixture().await;
        let job = fixture.job.clone();

        let decision = fixture
            .decisioning
            .submit_decision(request(
                &job,
                DecisionVerdict::AutomaticClose(AutomaticCloseReason::ItemDeletedBeforeReview),
            ))
            .await
            .expect("auto close");

        assert!(decision.is_automatic_close());
        tokio::task::yield_now().await;
        assert!(fixture.dispatched.try_recv().is_err());
    }
}
