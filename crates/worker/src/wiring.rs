//! Builds the ingestion handlers from configuration and the sqlite stores.

use std::sync::Arc;

use secrecy::SecretString;
use triage_core::actions::strikes::UserStrikeService;
use triage_core::actions::webhook::{HmacRequestSigner, ReqwestWebhookTransport};
use triage_core::config::AppConfig;
use triage_core::ingestion::object_store::LocalObjectStore;
use triage_core::{
    ActionPublisher, ColdStorageBatcher, ItemProcessingPipeline, JobRouter, RoutingEngine,
    RoutingRuleCache, RuleEngine, TextSignals,
};
use triage_db::{
    DbPool, SqlDeadLetterSink, SqlExecutionLog, SqlItemInvestigation, SqlModerationCatalog,
    SqlQueueStore, SqlRoutingRuleStore, SqlStrikeStore,
};

use crate::bootstrap::BootstrapError;

pub fn item_pipeline(
    config: &AppConfig,
    pool: &DbPool,
) -> Result<ItemProcessingPipeline, BootstrapError> {
    let catalog = Arc::new(SqlModerationCatalog::new(pool.clone()));
    let queues = Arc::new(SqlQueueStore::new(pool.clone()));
    let investigation = Arc::new(SqlItemInvestigation::new(pool.clone()));
    let execution_log = Arc::new(SqlExecutionLog::new(pool.clone()));
    let dead_letters = Arc::new(SqlDeadLetterSink::new(pool.clone()));
    let signals = Arc::new(TextSignals);

    let router = JobRouter::new(
        RoutingRuleCache::new(
            Arc::new(SqlRoutingRuleStore::new(pool.clone())),
            config.routing.cache_directives(),
        ),
        RoutingEngine::new(signals.clone(), execution_log.clone()),
        queues,
    );

    let signer = HmacRequestSigner::new(signing_key(config));
    let webhooks = ReqwestWebhookTransport::new(
        Arc::new(signer),
        config.actions.signature_header.clone(),
        config.actions.webhook_timeout(),
    )
    .map_err(|error| BootstrapError::WebhookClient(error.to_string()))?;

    let strikes = UserStrikeService::new(
        Arc::new(SqlStrikeStore::new(pool.clone())),
        catalog.clone(),
    );
    let publisher = ActionPublisher::new(
        Arc::new(webhooks),
        Arc::new(router),
        investigation.clone(),
        execution_log.clone(),
        config.actions.retry_policy(),
    )
    .with_strikes(Arc::new(strikes));

    let rules = RuleEngine::new(catalog.clone(), signals, execution_log.clone(), publisher);
    Ok(ItemProcessingPipeline::new(
        catalog,
        investigation,
        Arc::new(rules),
        execution_log,
        dead_letters,
    ))
}

pub fn cold_storage_batcher(config: &AppConfig, pool: &DbPool) -> ColdStorageBatcher {
    ColdStorageBatcher::new(
        Arc::new(LocalObjectStore::new(config.cold_storage.output_dir.clone())),
        Arc::new(SqlDeadLetterSink::new(pool.clone())),
        config.cold_storage.batcher_settings(),
    )
}

fn signing_key(config: &AppConfig) -> SecretString {
    config.signing.master_key.clone()
}
