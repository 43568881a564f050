//! Unified `Database` trait: single async interface for sources and work items.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::queue::model::{QueueName, QueueStats, WorkItem, WorkItemId};
use crate::scheduler::source::{NewSource, Source, SourceId};

/// Backend-agnostic database trait.
///
/// Several processes may hold their own backend over the same durable store;
/// `claim_next_work` is the only operation expected to contend.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Sources ─────────────────────────────────────────────────────

    /// Register a new source.
    async fn create_source(&self, source: &NewSource) -> Result<Source, DatabaseError>;

    /// Get a source by ID.
    async fn get_source(&self, id: SourceId) -> Result<Option<Source>, DatabaseError>;

    /// All sources, ordered by ID.
    async fn list_sources(&self) -> Result<Vec<Source>, DatabaseError>;

    /// Sources with the active flag set.
    async fn list_active_sources(&self) -> Result<Vec<Source>, DatabaseError>;

    /// Flip the active flag. Returns false if the source does not exist.
    async fn set_source_active(&self, id: SourceId, active: bool) -> Result<bool, DatabaseError>;

    /// Record the end of a fetch attempt.
    async fn set_last_fetch_time(
        &self,
        id: SourceId,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Work items ──────────────────────────────────────────────────

    /// Append a new Pending item with retry count 0. No deduplication.
    async fn enqueue_work(
        &self,
        queue: &QueueName,
        payload_ref: &str,
    ) -> Result<WorkItem, DatabaseError>;

    /// Atomically claim the oldest Pending item of `queue` for `worker`.
    ///
    /// When `stale_before` is given, Processing items last touched before that
    /// instant are eligible too (their previous holder is presumed dead).
    async fn claim_next_work(
        &self,
        queue: &QueueName,
        worker: Uuid,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<WorkItem>, DatabaseError>;

    /// Increment the retry count of a Processing item and return the new value.
    ///
    /// Items in any other status keep their count, which is returned as is.
    /// Returns 0 if the item does not exist.
    async fn record_work_failure(
        &self,
        id: WorkItemId,
        error: Option<&str>,
    ) -> Result<u32, DatabaseError>;

    /// Move a non-terminal item to Failed. Returns false if nothing changed.
    async fn mark_work_failed(
        &self,
        id: WorkItemId,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Move a non-terminal item to Completed. Returns false if nothing changed.
    async fn mark_work_completed(
        &self,
        id: WorkItemId,
        result: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Get a work item by ID.
    async fn get_work_item(&self, id: WorkItemId) -> Result<Option<WorkItem>, DatabaseError>;

    /// Whether any item of `queue` already carries `payload_ref`.
    async fn has_payload(&self, queue: &QueueName, payload_ref: &str)
    -> Result<bool, DatabaseError>;

    /// Per-status counts for `queue`.
    async fn work_stats(&self, queue: &QueueName) -> Result<QueueStats, DatabaseError>;
}
