use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::item::{ItemIdentifier, ItemSubmission, OrgId};
use crate::errors::StoreError;

/// Store of submitted items kept for reviewers and author-level actions.
#[async_trait]
pub trait ItemInvestigation: Send + Sync {
    /// Re-inserting the same submission id is a no-op.
    async fn insert_item(&self, item: &ItemSubmission) -> Result<(), StoreError>;

    /// Latest submission of the item.
    async fn get_item(
        &self,
        org_id: &OrgId,
        item: &ItemIdentifier,
    ) -> Result<Option<ItemSubmission>, StoreError>;

    /// Latest submissions in `thread` created at or before `before`, newest first.
    async fn get_thread_items(
        &self,
        org_id: &OrgId,
        thread: &ItemIdentifier,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ItemSubmission>, StoreError>;
}
