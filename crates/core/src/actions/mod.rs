//! Action dispatch: every triggered action runs with bounded retries and leaves exactly one
//! execution row behind, whether it succeeded or not.

pub mod strikes;
pub mod webhook;

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::audit::ActionExecutionLogger;
use crate::domain::action::{
    ActionExecution, ActionKind, ActionResult, ActionTarget, PolicyId, PublishContext,
    TriggeredAction,
};
use crate::domain::correlation::{CorrelationId, CorrelationSource};
use crate::domain::item::{ItemSubmission, ItemTypeKind};
use crate::domain::job::{EnqueueSource, JobKind, JobPayload};
use crate::errors::{Classify, ErrorClass, StoreError};
use crate::investigation::ItemInvestigation;
use crate::retry::{with_retries, RetryPolicy};
use crate::routing::{JobRouter, RoutingError};

use strikes::{StrikeCandidate, UserStrikeService};
use webhook::{webhook_body, WebhookRequest, WebhookTransport};

/// Thread items attached to an author review job.
const THREAD_CONTEXT_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("webhook rejected the request with status {status}")]
    Rejected { status: u16 },
    #[error("webhook delivery failed: {0}")]
    Transport(String),
    #[error("author of item `{0}` could not be resolved")]
    AuthorUnresolved(String),
    #[error("item `{0}` is not available")]
    ItemUnavailable(String),
    #[error("action payload could not be built: {0}")]
    Invalid(String),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ActionError {
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

impl Classify for ActionError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected { .. }
            | Self::AuthorUnresolved(_)
            | Self::ItemUnavailable(_)
            | Self::Invalid(_) => ErrorClass::Validation,
            Self::Transport(_) => ErrorClass::Transient,
            Self::Routing(error) => error.class(),
            Self::Store(error) => error.class(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("action execution could not be logged: {0}")]
    ExecutionLog(#[source] StoreError),
}

impl Classify for PublishError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

#[derive(Clone)]
pub struct ActionPublisher {
    webhooks: Arc<dyn WebhookTransport>,
    router: Arc<JobRouter>,
    investigation: Arc<dyn ItemInvestigation>,
    logger: Arc<dyn ActionExecutionLogger>,
    strikes: Option<Arc<UserStrikeService>>,
    retry: RetryPolicy,
}

impl ActionPublisher {
    pub fn new(
        webhooks: Arc<dyn WebhookTransport>,
        router: Arc<JobRouter>,
        investigation: Arc<dyn ItemInvestigation>,
        logger: Arc<dyn ActionExecutionLogger>,
        retry: RetryPolicy,
    ) -> Self {
        Self { webhooks, router, investigation, logger, strikes: None, retry }
    }

    pub fn with_strikes(mut self, strikes: Arc<UserStrikeService>) -> Self {
        self.strikes = Some(strikes);
        self
    }

    /// Records user strikes in the background, then dispatches every action in parallel.
    ///
    /// Delivery is at least once. Execution rows for the whole call are written together
    /// after every action has run; if that write fails the error is returned even though the
    /// webhooks and enqueues already happened, and a batch replay dispatches them again.
    pub async fn publish_actions(
        &self,
        triggered: Vec<TriggeredAction>,
        context: PublishContext,
    ) -> Result<Vec<ActionResult>, PublishError> {
        self.spawn_user_strikes(&triggered, &context);
        self.dispatch_all(triggered, &context).await
    }

    /// Dispatches without touching user strikes.
    pub async fn dispatch_all(
        &self,
        triggered: Vec<TriggeredAction>,
        context: &PublishContext,
    ) -> Result<Vec<ActionResult>, PublishError> {
        if triggered.is_empty() {
            return Ok(Vec::new());
        }
        let (results, executions): (Vec<ActionResult>, Vec<ActionExecution>) =
            join_all(triggered.iter().map(|entry| self.dispatch_one(entry, context)))
                .await
                .into_iter()
                .unzip();

        if let Err(error) = self.logger.log_action_executions(executions).await {
            error!(
                event_name = "actions.execution_log.failed",
                correlation_id = %context.correlation_id,
                org_id = %context.org_id.0,
                dispatched = results.len(),
                error = %error,
                "actions dispatched but their executions could not be logged"
            );
            return Err(PublishError::ExecutionLog(error));
        }
        Ok(results)
    }

    async fn dispatch_one(
        &self,
        triggered: &TriggeredAction,
        context: &PublishContext,
    ) -> (ActionResult, ActionExecution) {
        let action = &triggered.action;
        let started_at = Utc::now();
        let outcome =
            with_retries(self.retry, ActionError::is_retryable, |_| self.execute(triggered, context))
                .await;

        match &outcome {
            Ok(()) => debug!(
                event_name = "actions.dispatch.succeeded",
                correlation_id = %context.correlation_id,
                org_id = %context.org_id.0,
                action_id = %action.id.0,
                kind = action.kind.as_str(),
                "action dispatched"
            ),
            Err(error) => warn!(
                event_name = "actions.dispatch.failed",
                correlation_id = %context.correlation_id,
                org_id = %context.org_id.0,
                action_id = %action.id.0,
                kind = action.kind.as_str(),
                error_class = error.class().as_str(),
                error = %error,
                "action dispatch failed"
            ),
        }

        let target = context.target.identifier().clone();
        let execution = ActionExecution {
            org_id: context.org_id.clone(),
            action_id: action.id.clone(),
            action_name: action.name.clone(),
            target: target.clone(),
            policy_ids: policy_ids(triggered),
            matching_rule_ids: triggered.matching_rules.iter().map(|rule| rule.id.clone()).collect(),
            rule_environment: triggered.rule_environment,
            correlation_id: context.correlation_id.to_string(),
            actor_id: context.actor_id.clone(),
            job_id: context.job_id.clone(),
            success: outcome.is_ok(),
            started_at,
            finished_at: Utc::now(),
        };
        (ActionResult { action_id: action.id.clone(), target, success: outcome.is_ok() }, execution)
    }

    async fn execute(
        &self,
        triggered: &TriggeredAction,
        context: &PublishContext,
    ) -> Result<(), ActionError> {
        match &triggered.action.kind {
            ActionKind::CustomWebhook { callback_url, headers, custom_params } => {
                let body = webhook_body(
                    context.target.identifier(),
                    &triggered.action.id,
                    &triggered.policies,
                    &triggered.matching_rules,
                    custom_params,
                    context.actor_email.as_deref(),
                );
                let body = serde_json::to_vec(&body)
                    .map_err(|error| ActionError::Invalid(error.to_string()))?;
                self.webhooks
                    .post(WebhookRequest {
                        org_id: context.org_id.clone(),
                        url: callback_url.clone(),
                        headers: headers.clone(),
                        body,
                    })
                    .await
            }
            ActionKind::EnqueueToReview => {
                self.enqueue_target(JobKind::Review, triggered, context).await
            }
            ActionKind::EnqueueToEscalation => {
                self.enqueue_target(JobKind::Escalation, triggered, context).await
            }
            ActionKind::EnqueueAuthorToReview => self.enqueue_author(triggered, context).await,
        }
    }

    async fn enqueue_target(
        &self,
        kind: JobKind,
        triggered: &TriggeredAction,
        context: &PublishContext,
    ) -> Result<(), ActionError> {
        let item = self.resolve_target(context).await?;
        let mut payload = JobPayload::review(item, EnqueueSource::PostActions);
        payload.kind = kind;
        payload.policy_ids = policy_ids(triggered);

        let job =
            self.router.enqueue(payload, &policy_ids(triggered), &context.correlation_id).await?;
        info!(
            event_name = "actions.job.enqueued",
            correlation_id = %context.correlation_id,
            org_id = %context.org_id.0,
            job_id = %job.id.0,
            queue_id = %job.queue_id.0,
            kind = kind.as_str(),
            "item enqueued by action"
        );
        Ok(())
    }

    async fn enqueue_author(
        &self,
        triggered: &TriggeredAction,
        context: &PublishContext,
    ) -> Result<(), ActionError> {
        let item = self.resolve_target(context).await?;
        let creator =
            item.creator.clone().ok_or_else(|| ActionError::AuthorUnresolved(item.item.id.clone()))?;
        let author = self
            .investigation
            .get_item(&context.org_id, &creator)
            .await?
            .ok_or_else(|| ActionError::AuthorUnresolved(item.item.id.clone()))?;

        let thread_items = match (&item.thread, item.created_at) {
            (Some(thread), Some(created_at)) => {
                self.investigation
                    .get_thread_items(&context.org_id, thread, created_at, THREAD_CONTEXT_LIMIT)
                    .await?
            }
            _ => Vec::new(),
        };

        let mut payload = JobPayload::review(author, EnqueueSource::PostActions);
        payload.policy_ids = policy_ids(triggered);
        payload.reported_items = vec![item.item.clone()];
        payload.thread_items = thread_items;

        let job =
            self.router.enqueue(payload, &policy_ids(triggered), &context.correlation_id).await?;
        info!(
            event_name = "actions.author.enqueued",
            correlation_id = %context.correlation_id,
            org_id = %context.org_id.0,
            job_id = %job.id.0,
            queue_id = %job.queue_id.0,
            author_id = %creator.id,
            "item author enqueued for review"
        );
        Ok(())
    }

    async fn resolve_target(&self, context: &PublishContext) -> Result<ItemSubmission, ActionError> {
        match &context.target {
            ActionTarget::Submission(submission) => Ok(submission.as_ref().clone()),
            ActionTarget::Identifier { item, .. } => self
                .investigation
                .get_item(&context.org_id, item)
                .await?
                .ok_or_else(|| ActionError::ItemUnavailable(item.id.clone())),
        }
    }

    fn spawn_user_strikes(&self, triggered: &[TriggeredAction], context: &PublishContext) {
        let Some(strikes) = self.strikes.clone() else {
            return;
        };
        if !triggered.iter().any(|entry| entry.action.apply_user_strikes) {
            return;
        }

        let publisher = self.clone();
        let triggered = triggered.to_vec();
        let context = context.clone();
        tokio::spawn(async move {
            if let Err(error) = publisher.apply_user_strikes(&strikes, &triggered, &context).await {
                warn!(
                    event_name = "actions.user_strikes.failed",
                    correlation_id = %context.correlation_id,
                    org_id = %context.org_id.0,
                    error = %error,
                    "user strikes could not be applied"
                );
            }
        });
    }

    async fn apply_user_strikes(
        &self,
        strikes: &UserStrikeService,
        triggered: &[TriggeredAction],
        context: &PublishContext,
    ) -> Result<(), StoreError> {
        let target = context.target.identifier();
        let kind = context.target.kind();
        let creator = match context.target.submission() {
            Some(submission) => submission.creator.clone(),
            None if kind == ItemTypeKind::User => None,
            None => self
                .investigation
                .get_item(&context.org_id, target)
                .await?
                .and_then(|submission| submission.creator),
        };

        let Some(candidate) = StrikeCandidate::select(triggered, target, kind, creator.as_ref())
        else {
            return Ok(());
        };
        let actions = strikes.apply(&context.org_id, &candidate).await?;
        if actions.is_empty() {
            return Ok(());
        }

        let strike_context = PublishContext {
            org_id: context.org_id.clone(),
            correlation_id: CorrelationId::generate(CorrelationSource::UserStrikeActionExecution),
            target: ActionTarget::Identifier { item: candidate.user.clone(), kind: ItemTypeKind::User },
            actor_id: None,
            actor_email: None,
            job_id: None,
        };
        info!(
            event_name = "actions.user_strikes.threshold_crossed",
            correlation_id = %strike_context.correlation_id,
            parent_correlation_id = %context.correlation_id,
            org_id = %context.org_id.0,
            user_id = %candidate.user.id,
            actions = actions.len(),
            "strike threshold crossed"
        );

        let triggered = actions
            .into_iter()
            .map(|action| TriggeredAction::manual(action, vec![candidate.policy.clone()]))
            .collect();
        if let Err(error) = self.dispatch_all(triggered, &strike_context).await {
            warn!(
                event_name = "actions.user_strikes.dispatch_failed",
                correlation_id = %strike_context.correlation_id,
                error = %error,
                "threshold actions could not be logged"
            );
        }
        Ok(())
    }
}

fn policy_ids(triggered: &TriggeredAction) -> Vec<PolicyId> {
    triggered.policies.iter().map(|policy| policy.id.clone()).collect()
}
