//! Work item types.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a work item. Assigned by the store in insertion order.
pub type WorkItemId = i64;

/// Name of a logical queue inside the shared `work_items` table.
///
/// Every consumer (summarizer, vision analyzer, ...) owns one queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(Cow<'static, str>);

impl QueueName {
    /// Text summarization work.
    pub const SUMMARIZE: QueueName = QueueName(Cow::Borrowed("summarize"));
    /// Image analysis work.
    pub const ANALYZE_IMAGE: QueueName = QueueName(Cow::Borrowed("analyze_image"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a work item.
///
/// Transitions only move forward: `Pending → Processing → Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Gave up: retries exhausted or payload unusable.
    Failed,
    /// Processed successfully.
    Completed,
}

impl WorkStatus {
    /// Completed and Failed accept no further status writes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown work status: {other}")),
        }
    }
}

/// A unit of asynchronous follow-on processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub queue: QueueName,
    /// Opaque key the consumer resolves on its own (URL, file path, ...).
    pub payload_ref: String,
    pub status: WorkStatus,
    pub retry_count: u32,
    /// Worker that holds (or last held) the claim.
    pub claimed_by: Option<Uuid>,
    pub last_error: Option<String>,
    /// Result data reported by the processor on success.
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status item counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
    pub completed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.failed + self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!WorkStatus::Pending.is_terminal());
        assert!(!WorkStatus::Processing.is_terminal());
        assert!(WorkStatus::Failed.is_terminal());
        assert!(WorkStatus::Completed.is_terminal());
    }

    #[test]
    fn status_parses_db_strings() {
        for status in [
            WorkStatus::Pending,
            WorkStatus::Processing,
            WorkStatus::Failed,
            WorkStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<WorkStatus>().unwrap(), status);
        }
        assert!("stuck".parse::<WorkStatus>().is_err());
    }

    #[test]
    fn queue_name_constants_match_owned() {
        assert_eq!(QueueName::SUMMARIZE, QueueName::new("summarize"));
        assert_eq!(QueueName::ANALYZE_IMAGE.to_string(), "analyze_image");
    }
}
