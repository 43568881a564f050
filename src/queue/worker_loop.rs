//! Generic claim → process → acknowledge loop.
//!
//! Every downstream consumer (summarizer, vision analyzer, ...) is a
//! `WorkerLoop` over its own queue with its own `Processor` and
//! `RetryPolicy`. A claimed item stays with the loop that claimed it until it
//! reaches a terminal status: retryable failures are re-attempted in place
//! after `backoff`, up to `max_retries`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::queue::model::{WorkItem, WorkItemId};
use crate::queue::work_queue::WorkQueue;

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Done. Carries optional result data to store with the item.
    Success(Option<String>),
    /// Transient failure; the item may be attempted again.
    Retryable(String),
    /// The payload can never be processed (missing resource, rejected input).
    Permanent(String),
}

/// The external processing step of a worker loop.
///
/// Must tolerate being called again with the same payload after a retryable
/// failure.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, payload_ref: &str) -> ProcessOutcome;
}

/// How a claimed item left the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Failed,
    /// Left in Processing: shutdown during backoff, or the retry could not be
    /// recorded. Only stale re-claim picks it up again.
    Released,
}

/// Summary of one claimed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub item_id: WorkItemId,
    pub disposition: Disposition,
    /// Processing calls made during this claim.
    pub attempts: u32,
}

/// Wait for `duration` unless shutdown is signalled first.
///
/// Returns `true` if the caller should stop. A dropped sender counts as
/// shutdown.
pub(crate) async fn sleep_or_shutdown(
    shutdown: &mut watch::Receiver<bool>,
    duration: Duration,
) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// A polling consumer of one work queue.
pub struct WorkerLoop {
    id: Uuid,
    queue: WorkQueue,
    processor: Arc<dyn Processor>,
    policy: RetryPolicy,
}

impl WorkerLoop {
    /// A `stale_after` shorter than one attempt plus backoff is raised to
    /// [`RetryPolicy::min_stale_after`], so a live holder is never re-claimed.
    pub fn new(queue: WorkQueue, processor: Arc<dyn Processor>, policy: RetryPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue,
            processor,
            policy: policy.normalized(),
        }
    }

    /// Identity written to `claimed_by` on every claim.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Claim and fully handle at most one item.
    ///
    /// Returns `None` right away when the queue is empty.
    pub async fn run_once(&self) -> Option<ItemReport> {
        let item = self.queue.claim_next(self.id, self.policy.stale_after).await?;
        Some(self.handle(item, None).await)
    }

    /// Poll until shutdown is signalled. The item in hand is finished first,
    /// except that a pending backoff is cut short.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker = %self.id,
            queue = %self.queue.name(),
            processor = self.processor.name(),
            "Worker loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.claim_next(self.id, self.policy.stale_after).await {
                Some(item) => {
                    self.handle(item, Some(&mut shutdown)).await;
                }
                None => {
                    if sleep_or_shutdown(&mut shutdown, self.policy.idle_poll).await {
                        break;
                    }
                }
            }
        }

        info!(worker = %self.id, queue = %self.queue.name(), "Worker loop stopped");
    }

    /// Run the loop on a background task.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn attempt(&self, payload_ref: &str) -> ProcessOutcome {
        match tokio::time::timeout(self.policy.process_timeout, self.processor.process(payload_ref))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => ProcessOutcome::Retryable(format!(
                "{} timed out after {:?}",
                self.processor.name(),
                self.policy.process_timeout
            )),
        }
    }

    async fn handle(
        &self,
        item: WorkItem,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> ItemReport {
        let id = item.id;
        let mut attempts = 0;

        // Re-claimed after its holder died between the last retry and the
        // terminal write.
        if item.retry_count >= self.policy.max_retries {
            warn!(
                item_id = id,
                queue = %self.queue.name(),
                retries = item.retry_count,
                "Claimed item already out of retries, marking failed"
            );
            self.queue
                .mark_failed(id, "max retries exceeded before reclaim")
                .await;
            return ItemReport {
                item_id: id,
                disposition: Disposition::Failed,
                attempts,
            };
        }

        debug!(
            worker = %self.id,
            item_id = id,
            payload = %item.payload_ref,
            retry_count = item.retry_count,
            "Processing work item"
        );

        let disposition = loop {
            attempts += 1;

            match self.attempt(&item.payload_ref).await {
                ProcessOutcome::Success(result) => {
                    self.queue.mark_completed(id, result.as_deref()).await;
                    info!(item_id = id, queue = %self.queue.name(), attempts, "Work item completed");
                    break Disposition::Completed;
                }
                ProcessOutcome::Permanent(reason) => {
                    warn!(item_id = id, queue = %self.queue.name(), "Work item failed permanently: {reason}");
                    self.queue.mark_failed(id, &reason).await;
                    break Disposition::Failed;
                }
                ProcessOutcome::Retryable(reason) => {
                    let retries = self.queue.record_failure_and_retry(id, &reason).await;
                    if retries == 0 {
                        warn!(item_id = id, "Could not record retry, releasing item: {reason}");
                        break Disposition::Released;
                    }
                    if retries >= self.policy.max_retries {
                        warn!(
                            item_id = id,
                            queue = %self.queue.name(),
                            retries,
                            "Max retries reached, marking failed: {reason}"
                        );
                        self.queue
                            .mark_failed(id, &format!("max retries exceeded: {reason}"))
                            .await;
                        break Disposition::Failed;
                    }

                    warn!(
                        item_id = id,
                        retries,
                        max_retries = self.policy.max_retries,
                        "Attempt failed, retrying: {reason}"
                    );
                    let stop = match shutdown.as_deref_mut() {
                        Some(rx) => sleep_or_shutdown(rx, self.policy.backoff).await,
                        None => {
                            tokio::time::sleep(self.policy.backoff).await;
                            false
                        }
                    };
                    if stop {
                        info!(item_id = id, "Shutdown during backoff, leaving item in processing");
                        break Disposition::Released;
                    }
                }
            }
        };

        ItemReport {
            item_id: id,
            disposition,
            attempts,
        }
    }
}
