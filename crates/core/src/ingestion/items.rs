//! Item-submission consumer: reconstruct, store for investigation, run rules, log outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{SubmissionLog, SubmissionLogger};
use crate::catalog::ModerationCatalog;
use crate::domain::correlation::{CorrelationId, CorrelationSource};
use crate::domain::item::{ItemIdentifier, ItemSubmission, ItemType, ItemTypeId, OrgId};
use crate::errors::{Classify, ErrorClass, StoreError};
use crate::ingestion::{
    BatchHandler, DeadLetter, DeadLetterSink, IngestionError, LogMessage, MessageBatch,
    TopicPartition,
};
use crate::investigation::ItemInvestigation;
use crate::retry::{with_retries, RetryPolicy};
use crate::rule_engine::RuleEngine;

#[derive(Debug, Deserialize)]
struct WireMessage {
    item: WireItem,
    metadata: WireMetadata,
}

#[derive(Debug, Deserialize)]
struct WireItem {
    id: String,
    data_json: String,
    #[serde(rename = "type")]
    item_type: WireItemType,
    submission_id: String,
}

#[derive(Debug, Deserialize)]
struct WireItemType {
    id: String,
    version: String,
    schema_variant: String,
}

#[derive(Debug, Deserialize)]
struct WireMetadata {
    org_id: String,
    request_id: String,
    submission_time: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ReconstructionError {
    #[error("malformed item message: {0}")]
    Malformed(String),
    #[error("item type `{item_type_id}` does not exist for org `{org_id}`")]
    UnknownItemType { org_id: String, item_type_id: String },
    #[error("required field `{0}` is missing")]
    MissingField(String),
    #[error("item type lookup failed: {0}")]
    Catalog(#[source] StoreError),
}

impl Classify for ReconstructionError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Catalog(_) => ErrorClass::Transient,
            _ => ErrorClass::Data,
        }
    }
}

struct Reconstructed {
    item: ItemSubmission,
    request_id: String,
}

pub struct ItemProcessingPipeline {
    catalog: Arc<dyn ModerationCatalog>,
    investigation: Arc<dyn ItemInvestigation>,
    rules: Arc<RuleEngine>,
    submissions: Arc<dyn SubmissionLogger>,
    dead_letters: Arc<dyn DeadLetterSink>,
    investigation_retry: RetryPolicy,
}

impl ItemProcessingPipeline {
    pub fn new(
        catalog: Arc<dyn ModerationCatalog>,
        investigation: Arc<dyn ItemInvestigation>,
        rules: Arc<RuleEngine>,
        submissions: Arc<dyn SubmissionLogger>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            catalog,
            investigation,
            rules,
            submissions,
            dead_letters,
            // one retry, 75 to 250 ms later
            investigation_retry: RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(250),
                max_delay: Duration::from_millis(250),
                jitter_floor: 0.3,
            },
        }
    }

    async fn reconstruct(&self, message: &LogMessage) -> Result<Reconstructed, ReconstructionError> {
        let wire: WireMessage = serde_json::from_slice(&message.payload)
            .map_err(|error| ReconstructionError::Malformed(error.to_string()))?;
        let data: Map<String, Value> = match serde_json::from_str(&wire.item.data_json) {
            Ok(Value::Object(data)) => data,
            Ok(_) => return Err(ReconstructionError::Malformed("item data is not an object".into())),
            Err(error) => return Err(ReconstructionError::Malformed(error.to_string())),
        };

        let org_id = OrgId(wire.metadata.org_id);
        let type_id = ItemTypeId(wire.item.item_type.id);
        let item_type = self
            .catalog
            .get_item_type(&org_id, &type_id)
            .await
            .map_err(ReconstructionError::Catalog)?
            .ok_or_else(|| ReconstructionError::UnknownItemType {
                org_id: org_id.0.clone(),
                item_type_id: type_id.0.clone(),
            })?;

        if let Some(missing) = item_type
            .required_fields()
            .find(|field| data.get(&field.name).map_or(true, Value::is_null))
        {
            return Err(ReconstructionError::MissingField(missing.name.clone()));
        }

        let roles = ItemRoles::read(&item_type, &data);
        Ok(Reconstructed {
            item: ItemSubmission {
                submission_id: wire.item.submission_id,
                org_id,
                item: ItemIdentifier { id: wire.item.id, type_id },
                item_type_kind: item_type.kind,
                item_type_version: wire.item.item_type.version,
                item_type_schema_variant: wire.item.item_type.schema_variant,
                data,
                creator: roles.creator,
                thread: roles.thread,
                created_at: roles.created_at,
                submission_time: wire.metadata.submission_time,
            },
            request_id: wire.metadata.request_id,
        })
    }

    async fn process(
        &self,
        reconstructed: Reconstructed,
        partition: &TopicPartition,
        offset: i64,
    ) -> Result<(), IngestionError> {
        let Reconstructed { item, request_id } = reconstructed;
        let correlation_id = CorrelationId::new(CorrelationSource::ItemSubmission, request_id.clone());

        let stored = with_retries(self.investigation_retry, |_: &StoreError| true, |_| {
            self.investigation.insert_item(&item)
        })
        .await;
        if let Err(error) = stored {
            warn!(
                event_name = "ingestion.investigation.insert_failed",
                correlation_id = %correlation_id,
                org_id = %item.org_id.0,
                item_id = %item.item.id,
                error = %error,
                "item not stored for investigation"
            );
        }

        let summary = self.rules.run_enabled_rules(&item, &correlation_id).await?;

        self.submissions
            .log_submission(SubmissionLog {
                org_id: item.org_id.clone(),
                request_id,
                submission_id: item.submission_id.clone(),
                item: item.item.clone(),
                rules_evaluated: summary.rules_evaluated,
                actions_published: summary.action_results.len(),
                occurred_at: Utc::now(),
            })
            .await
            .map_err(IngestionError::SubmissionLog)?;

        debug!(
            event_name = "ingestion.item.processed",
            correlation_id = %correlation_id,
            topic = %partition.topic,
            partition = partition.partition,
            offset,
            "item processed"
        );
        Ok(())
    }
}

#[async_trait]
impl BatchHandler for ItemProcessingPipeline {
    async fn handle_batch(&self, batch: &MessageBatch) -> Result<Option<i64>, IngestionError> {
        for message in &batch.messages {
            match self.reconstruct(message).await {
                Ok(reconstructed) => {
                    self.process(reconstructed, &batch.partition, message.offset).await?
                }
                Err(ReconstructionError::Catalog(error)) => return Err(IngestionError::Catalog(error)),
                Err(rejection) => {
                    warn!(
                        event_name = "ingestion.message.dead_lettered",
                        topic = %batch.partition.topic,
                        partition = batch.partition.partition,
                        offset = message.offset,
                        error = %rejection,
                        "diverting message to dead letters"
                    );
                    self.dead_letters
                        .write(DeadLetter::new(&batch.partition, message, rejection.to_string()))
                        .await
                        .map_err(IngestionError::DeadLetter)?;
                }
            }
        }
        Ok(batch.last_offset().map(|offset| offset + 1))
    }
}

#[derive(Default)]
struct ItemRoles {
    creator: Option<ItemIdentifier>,
    thread: Option<ItemIdentifier>,
    created_at: Option<DateTime<Utc>>,
}

impl ItemRoles {
    fn read(item_type: &ItemType, data: &Map<String, Value>) -> Self {
        let field = |name: &Option<String>| name.as_ref().and_then(|name| data.get(name));
        Self {
            creator: field(&item_type.roles.creator_id).and_then(related_item),
            thread: field(&item_type.roles.thread_id).and_then(related_item),
            created_at: field(&item_type.roles.created_at)
                .and_then(Value::as_str)
                .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
                .map(|timestamp| timestamp.with_timezone(&Utc)),
        }
    }
}

/// Related-item field values look like `{"id": "...", "typeId": "..."}`.
fn related_item(value: &Value) -> Option<ItemIdentifier> {
    let id = value.get("id")?.as_str()?;
    let type_id = value.get("typeId").or_else(|| value.get("type_id"))?.as_str()?;
    Some(ItemIdentifier::new(id, type_id))
}
