//! The orchestrator owns the store handle, the source scheduler and one worker
//! loop per queue, and is the operator's only mutating entry point.
//!
//! Several orchestrators can live in one process (tests do this); nothing here
//! is global.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{RetryPolicy, SchedulerConfig};
use crate::error::{DatabaseError, SchedulerError};
use crate::ingest::{Fetcher, MaintenanceTask};
use crate::queue::{Processor, QueueName, QueueStats, WorkQueue, WorkerLoop};
use crate::scheduler::{NewSource, SchedulerState, Source, SourceId, SourceScheduler};
use crate::store::Database;

struct WorkerSet {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct Orchestrator {
    db: Arc<dyn Database>,
    scheduler: SourceScheduler,
    workers: Vec<Arc<WorkerLoop>>,
    running_workers: Mutex<Option<WorkerSet>>,
}

impl Orchestrator {
    pub fn new(db: Arc<dyn Database>, config: SchedulerConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            scheduler: SourceScheduler::new(config, Arc::clone(&db), fetcher),
            db,
            workers: Vec::new(),
            running_workers: Mutex::new(None),
        }
    }

    pub fn with_maintenance(mut self, task: Arc<dyn MaintenanceTask>) -> Self {
        self.scheduler = self.scheduler.with_maintenance(task);
        self
    }

    /// Register a consumer for `queue`. Several workers may share a queue.
    pub fn with_worker(
        mut self,
        queue: QueueName,
        processor: Arc<dyn Processor>,
        policy: RetryPolicy,
    ) -> Self {
        let queue = WorkQueue::new(Arc::clone(&self.db), queue);
        self.workers
            .push(Arc::new(WorkerLoop::new(queue, processor, policy)));
        self
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn scheduler(&self) -> &SourceScheduler {
        &self.scheduler
    }

    pub fn workers(&self) -> &[Arc<WorkerLoop>] {
        &self.workers
    }

    /// A handle on `name` backed by the same store.
    pub fn queue(&self, name: QueueName) -> WorkQueue {
        WorkQueue::new(Arc::clone(&self.db), name)
    }

    /// Start the scheduler and every worker loop.
    pub async fn start(&self) {
        self.scheduler.start().await;

        let mut running = self.running_workers.lock().await;
        if running.is_some() {
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let handles = self
            .workers
            .iter()
            .map(|worker| Arc::clone(worker).spawn(rx.clone()))
            .collect();
        *running = Some(WorkerSet { shutdown, handles });
        info!(workers = self.workers.len(), "Orchestrator started");
    }

    /// Stop the scheduler (draining in-flight fetches), then stop the worker
    /// loops once they have finished their current item.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;

        if let Some(WorkerSet { shutdown, handles }) = self.running_workers.lock().await.take() {
            let _ = shutdown.send(true);
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Worker loop ended abnormally: {e}");
                }
            }
        }

        self.log_stats().await;
        info!("Orchestrator stopped");
    }

    // ── Operator surface ────────────────────────────────────────────

    pub async fn start_scheduler(&self) {
        self.scheduler.start().await;
    }

    pub async fn stop_scheduler(&self) {
        self.scheduler.stop().await;
    }

    pub async fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state().await
    }

    pub async fn activate(&self, id: SourceId) -> Result<(), SchedulerError> {
        self.scheduler.activate(id).await
    }

    pub async fn deactivate(&self, id: SourceId) -> Result<(), SchedulerError> {
        self.scheduler.deactivate(id).await
    }

    pub async fn trigger_now(&self, id: SourceId) -> Result<bool, SchedulerError> {
        self.scheduler.trigger_now(id).await
    }

    pub async fn add_source(&self, source: &NewSource) -> Result<Source, DatabaseError> {
        self.db.create_source(source).await
    }

    pub async fn sources(&self) -> Result<Vec<Source>, DatabaseError> {
        self.db.list_sources().await
    }

    /// Per-status counts of every queue with a registered worker.
    pub async fn stats(&self) -> Result<Vec<(QueueName, QueueStats)>, DatabaseError> {
        let mut names: Vec<QueueName> = Vec::new();
        for worker in &self.workers {
            if !names.contains(worker.queue().name()) {
                names.push(worker.queue().name().clone());
            }
        }

        let mut stats = Vec::with_capacity(names.len());
        for name in names {
            let counts = self.db.work_stats(&name).await?;
            stats.push((name, counts));
        }
        Ok(stats)
    }

    async fn log_stats(&self) {
        match self.stats().await {
            Ok(stats) => {
                for (queue, counts) in stats {
                    info!(
                        queue = %queue,
                        pending = counts.pending,
                        processing = counts.processing,
                        failed = counts.failed,
                        completed = counts.completed,
                        "Queue stats"
                    );
                }
            }
            Err(e) => error!("Failed to read queue stats: {e}"),
        }
    }
}
