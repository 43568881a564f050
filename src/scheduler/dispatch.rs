//! Bounded executor for keyed fetch tasks.

use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};

use crate::scheduler::in_flight::InFlightTracker;

/// Runs at most `workers` tasks at a time, and at most one per key.
///
/// Submissions for a key that is already in flight are dropped. The key is
/// released when its task ends, whether it returns, panics or is aborted.
pub struct DispatchPool<K> {
    permits: Arc<Semaphore>,
    tracker: InFlightTracker<K>,
    tasks: Mutex<JoinSet<()>>,
    workers: usize,
}

impl<K> DispatchPool<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            tracker: InFlightTracker::new(),
            tasks: Mutex::new(JoinSet::new()),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn tracker(&self) -> &InFlightTracker<K> {
        &self.tracker
    }

    /// Keys currently submitted and not yet finished (queued or running).
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `task` under `key`. Returns false if `key` is already in flight.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit<F>(&self, key: K, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(guard) = self.tracker.try_guard(key) else {
            return false;
        };
        debug!(key = %guard.key(), "Dispatching task");

        let permits = Arc::clone(&self.permits);
        let mut tasks = self.lock_tasks();
        while let Some(finished) = tasks.try_join_next() {
            log_join_result(finished);
        }
        tasks.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
        true
    }

    /// Wait for every submitted task to finish. Tasks submitted while draining
    /// are not awaited.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        while let Some(finished) = tasks.join_next().await {
            log_join_result(finished);
        }
    }
}

fn log_join_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Dispatch task panicked: {e}");
        } else {
            debug!("Dispatch task cancelled: {e}");
        }
    }
}
