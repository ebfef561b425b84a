use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::ingestion::{BatchHandler, ConsumerEvent, IngestionError, LogConsumer, MessageBatch};
use crate::retry::{with_retries, RetryPolicy};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunnerSettings {
    pub partition_concurrency: usize,
    pub heartbeat_interval: Duration,
    /// `max_attempts` is one more than the number of batch retries.
    pub batch_retry: RetryPolicy,
    pub idle_backoff: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(5), 5, Duration::from_millis(500))
    }
}

impl RunnerSettings {
    pub fn new(
        partition_concurrency: usize,
        heartbeat_interval: Duration,
        batch_max_retries: u32,
        retry_base_delay: Duration,
    ) -> Self {
        Self {
            partition_concurrency: partition_concurrency.max(1),
            heartbeat_interval,
            batch_retry: RetryPolicy {
                max_attempts: batch_max_retries.saturating_add(1),
                initial_delay: retry_base_delay,
                max_delay: retry_base_delay.saturating_mul(64),
                jitter_floor: 1.0,
            },
            idle_backoff: Duration::from_millis(100),
        }
    }
}

/// Drives a [`LogConsumer`] into a [`BatchHandler`].
///
/// Partitions are processed concurrently up to `partition_concurrency`; a partition never
/// has more than one batch in flight. A batch that keeps failing ends the run with a fatal
/// error so a supervisor can restart from the last committed offset.
pub struct ConsumerRunner {
    name: String,
    consumer: Arc<dyn LogConsumer>,
    handler: Arc<dyn BatchHandler>,
    settings: RunnerSettings,
}

impl ConsumerRunner {
    pub fn new(
        name: impl Into<String>,
        consumer: Arc<dyn LogConsumer>,
        handler: Arc<dyn BatchHandler>,
        settings: RunnerSettings,
    ) -> Self {
        Self { name: name.into(), consumer, handler, settings }
    }

    /// Runs until the log closes or `shutdown` flips to `true`. An in-flight poll result is
    /// always fully processed before shutdown is observed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), IngestionError> {
        info!(event_name = "ingestion.consumer.started", consumer = %self.name, "consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                event = self.consumer.poll() => event?,
            };

            match event {
                ConsumerEvent::Batches(batches) => self.process_batches(batches).await?,
                ConsumerEvent::Assigned(partitions) => {
                    info!(
                        event_name = "ingestion.partitions.assigned",
                        consumer = %self.name,
                        partitions = partitions.len(),
                        "partitions assigned"
                    );
                    self.handler.on_assigned(&partitions).await;
                }
                ConsumerEvent::Revoked(partitions) => {
                    info!(
                        event_name = "ingestion.partitions.revoked",
                        consumer = %self.name,
                        partitions = partitions.len(),
                        "partitions revoked"
                    );
                    self.handler.on_revoked(&partitions).await;
                }
                ConsumerEvent::Idle => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.settings.idle_backoff) => {}
                    }
                }
                ConsumerEvent::Closed => {
                    info!(event_name = "ingestion.consumer.drained", consumer = %self.name, "log closed");
                    break;
                }
            }
        }
        info!(event_name = "ingestion.consumer.stopped", consumer = %self.name, "consumer stopped");
        Ok(())
    }

    async fn process_batches(&self, batches: Vec<MessageBatch>) -> Result<(), IngestionError> {
        let outcomes: Vec<Result<(), IngestionError>> = stream::iter(batches)
            .map(|batch| async move { self.process_batch(&batch).await })
            .buffer_unordered(self.settings.partition_concurrency)
            .collect()
            .await;
        outcomes.into_iter().collect()
    }

    async fn process_batch(&self, batch: &MessageBatch) -> Result<(), IngestionError> {
        if batch.messages.is_empty() {
            return Ok(());
        }
        let policy = self.settings.batch_retry;
        let outcome = with_retries(policy, |_| true, |attempt| async move {
            if attempt > 0 {
                warn!(
                    event_name = "ingestion.batch.retrying",
                    consumer = %self.name,
                    topic = %batch.partition.topic,
                    partition = batch.partition.partition,
                    attempt,
                    "retrying batch"
                );
            }
            self.with_heartbeat(self.apply(batch)).await
        })
        .await;

        outcome.map_err(|source| {
            error!(
                event_name = "ingestion.batch.failed",
                consumer = %self.name,
                topic = %batch.partition.topic,
                partition = batch.partition.partition,
                first_offset = batch.messages.first().map(|message| message.offset),
                attempts = policy.max_attempts,
                error = %source,
                "batch retries exhausted"
            );
            IngestionError::RetriesExhausted {
                partition: batch.partition.to_string(),
                attempts: policy.max_attempts,
                source: Box::new(source),
            }
        })
    }

    async fn apply(&self, batch: &MessageBatch) -> Result<(), IngestionError> {
        let Some(offset) = self.handler.handle_batch(batch).await? else {
            return Ok(());
        };
        self.consumer.commit(&batch.partition, offset).await?;
        self.handler.on_committed(&batch.partition, offset).await;
        debug!(
            event_name = "ingestion.offset.committed",
            consumer = %self.name,
            topic = %batch.partition.topic,
            partition = batch.partition.partition,
            offset,
            "offset committed"
        );
        Ok(())
    }

    /// Keeps group membership alive while `work` runs.
    async fn with_heartbeat<F: Future>(&self, work: F) -> F::Output {
        let consumer = Arc::clone(&self.consumer);
        let period = self.settings.heartbeat_interval;
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if let Err(error) = consumer.heartbeat().await {
                    debug!(event_name = "ingestion.heartbeat.failed", error = %error, "heartbeat failed");
                }
            }
        });
        let output = work.await;
        ticker.abort();
        output
    }
}
