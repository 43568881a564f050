//! Queue handle over the durable store.
//!
//! A `WorkQueue` is cheap to clone and may be used from any task. Store
//! errors are logged here and downgraded, so callers only see queue state.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{QueueName, QueueStats, WorkItem, WorkItemId};
use crate::store::Database;

/// Durable FIFO of work items for one named queue.
#[derive(Clone)]
pub struct WorkQueue {
    db: Arc<dyn Database>,
    name: QueueName,
}

impl WorkQueue {
    pub fn new(db: Arc<dyn Database>, name: QueueName) -> Self {
        Self { db, name }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Append a Pending item. The queue performs no deduplication.
    pub async fn enqueue(&self, payload_ref: &str) -> Result<WorkItem, DatabaseError> {
        self.db.enqueue_work(&self.name, payload_ref).await
    }

    /// Claim the oldest Pending item for `worker`, or `None` if there is none.
    ///
    /// With `stale_after`, items left in Processing for longer than that are
    /// claimable as well. Store errors are reported as an empty queue.
    pub async fn claim_next(
        &self,
        worker: Uuid,
        stale_after: Option<std::time::Duration>,
    ) -> Option<WorkItem> {
        let stale_before = stale_after
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() - d);

        match self.db.claim_next_work(&self.name, worker, stale_before).await {
            Ok(item) => item,
            Err(e) => {
                error!(queue = %self.name, "Claim failed: {e}");
                None
            }
        }
    }

    /// Count one failed attempt. Returns the new retry count, 0 on error or
    /// if the item no longer exists.
    pub async fn record_failure_and_retry(&self, id: WorkItemId, error: &str) -> u32 {
        match self.db.record_work_failure(id, Some(error)).await {
            Ok(count) => count,
            Err(e) => {
                error!(queue = %self.name, item_id = id, "Failed to record retry: {e}");
                0
            }
        }
    }

    /// Move the item to Failed. No-op on terminal items.
    pub async fn mark_failed(&self, id: WorkItemId, reason: &str) {
        match self.db.mark_work_failed(id, Some(reason)).await {
            Ok(true) => {}
            Ok(false) => warn!(queue = %self.name, item_id = id, "Item already terminal, not marked failed"),
            Err(e) => error!(queue = %self.name, item_id = id, "Failed to mark item failed: {e}"),
        }
    }

    /// Move the item to Completed, storing the processor's result. No-op on
    /// terminal items.
    pub async fn mark_completed(&self, id: WorkItemId, result: Option<&str>) {
        match self.db.mark_work_completed(id, result).await {
            Ok(true) => {}
            Ok(false) => warn!(queue = %self.name, item_id = id, "Item already terminal, not marked completed"),
            Err(e) => error!(queue = %self.name, item_id = id, "Failed to mark item completed: {e}"),
        }
    }

    /// Whether an item with this payload was ever enqueued here.
    pub async fn contains(&self, payload_ref: &str) -> Result<bool, DatabaseError> {
        self.db.has_payload(&self.name, payload_ref).await
    }

    pub async fn stats(&self) -> Result<QueueStats, DatabaseError> {
        self.db.work_stats(&self.name).await
    }

    pub async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, DatabaseError> {
        self.db.get_work_item(id).await
    }
}
