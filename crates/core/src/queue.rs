use async_trait::async_trait;

use crate::domain::item::OrgId;
use crate::domain::job::{Job, JobId, JobPayload, QueueId};
use crate::errors::StoreError;

/// Lock-token based job store holding the live review queues.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
        payload: JobPayload,
    ) -> Result<Job, StoreError>;

    /// Missing ids are skipped rather than reported.
    async fn get_jobs(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
        ids: &[JobId],
    ) -> Result<Vec<Job>, StoreError>;

    /// Hands out the oldest unlocked job under a fresh lock token.
    async fn dequeue(&self, org_id: &OrgId, queue_id: &QueueId) -> Result<Option<Job>, StoreError>;

    /// Fails with `StoreError::Conflict` when `lock_token` is not the job's current lock.
    async fn remove_job(
        &self,
        org_id: &OrgId,
        queue_id: &QueueId,
        job_id: &JobId,
        lock_token: &str,
    ) -> Result<(), StoreError>;

    async fn check_queue_exists(&self, org_id: &OrgId, queue_id: &QueueId)
        -> Result<bool, StoreError>;

    async fn get_default_queue_id_for_org(
        &self,
        org_id: &OrgId,
    ) -> Result<Option<QueueId>, StoreError>;
}
