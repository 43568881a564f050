//! Collaborator contracts used by the scheduler.
//!
//! Fetching a source and daily maintenance are performed by external code;
//! the scheduler only decides when to call them and records what they report.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::queue::QueueName;
use crate::scheduler::source::Source;

/// Work derived from a fetch, to be enqueued on `queue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUp {
    pub queue: QueueName,
    pub payload_ref: String,
}

impl FollowUp {
    pub fn new(queue: QueueName, payload_ref: impl Into<String>) -> Self {
        Self {
            queue,
            payload_ref: payload_ref.into(),
        }
    }
}

/// What a fetch produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    /// Items that were not seen before.
    pub new_items: usize,
    pub follow_ups: Vec<FollowUp>,
}

/// Downloads a source and extracts new content from it.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `source` once. Items already known must not be reported again.
    async fn fetch(&self, source: &Source) -> Result<FetchOutcome, FetchError>;
}

/// An action run at most once per calendar day.
#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), FetchError>;
}
