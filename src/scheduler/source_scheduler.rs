//! Periodic source scheduler.
//!
//! One background loop ticks every `tick`; every `eval_every_ticks` ticks it
//! lists the active sources, submits every due one to the dispatch pool and
//! checks the daily maintenance trigger. The first evaluation happens on the
//! first tick, right after `start()`. Each pass runs on its own task, so a
//! pass that panics is logged and the loop goes on.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Local, Utc};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{DatabaseError, SchedulerError};
use crate::ingest::{Fetcher, MaintenanceTask};
use crate::scheduler::daily::DailyTrigger;
use crate::scheduler::dispatch::DispatchPool;
use crate::scheduler::source::{Source, SourceId, is_due};
use crate::store::Database;

/// Whether the tick loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Stopped,
}

struct RunningLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Shared {
    config: SchedulerConfig,
    db: Arc<dyn Database>,
    fetcher: Arc<dyn Fetcher>,
    pool: DispatchPool<SourceId>,
    maintenance: Option<Arc<dyn MaintenanceTask>>,
    daily: Mutex<DailyTrigger>,
}

/// Decides when each source is fetched and keeps fetches of one source from
/// overlapping.
pub struct SourceScheduler {
    shared: Arc<Shared>,
    running: AsyncMutex<Option<RunningLoop>>,
}

impl SourceScheduler {
    pub fn new(config: SchedulerConfig, db: Arc<dyn Database>, fetcher: Arc<dyn Fetcher>) -> Self {
        let retry_pause =
            chrono::Duration::from_std(config.maintenance_retry).unwrap_or_else(|_| chrono::Duration::days(1));
        let daily = DailyTrigger::new(config.maintenance_time).with_retry_pause(retry_pause);
        Self {
            shared: Arc::new(Shared {
                pool: DispatchPool::new(config.max_fetch_workers),
                config,
                db,
                fetcher,
                maintenance: None,
                daily: Mutex::new(daily),
            }),
            running: AsyncMutex::new(None),
        }
    }

    /// Attach the daily maintenance action. Must be called before `start()`;
    /// once the loop holds the shared state the task is ignored.
    pub fn with_maintenance(mut self, task: Arc<dyn MaintenanceTask>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.maintenance = Some(task),
            None => warn!(
                task = task.name(),
                "Scheduler already started, maintenance task not attached"
            ),
        }
        self
    }

    pub async fn state(&self) -> SchedulerState {
        match self.running.lock().await.as_ref() {
            Some(running) if !running.handle.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Sources with a fetch submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.pool.in_flight()
    }

    pub fn is_in_flight(&self, id: SourceId) -> bool {
        self.shared.pool.tracker().contains(&id)
    }

    /// Start the tick loop. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Source scheduler already running");
            return;
        }

        let (shutdown, rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { shared.run_loop(rx).await });
        *running = Some(RunningLoop { shutdown, handle });

        let eval_every = self.shared.config.tick * self.shared.config.eval_every_ticks.max(1);
        info!(
            workers = self.shared.pool.workers(),
            ?eval_every,
            "Source scheduler started"
        );
    }

    /// Stop the tick loop, then wait for every dispatched fetch to finish.
    /// Running fetches are not cancelled.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(RunningLoop { shutdown, handle }) = running {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                error!("Source scheduler loop ended abnormally: {e}");
            }
        }

        let pending = self.shared.pool.in_flight();
        if pending > 0 {
            info!(pending, "Waiting for in-flight fetches");
        }
        self.shared.pool.drain().await;
        info!("Source scheduler stopped");
    }

    /// Mark a source active and fetch it right away, due or not.
    pub async fn activate(&self, id: SourceId) -> Result<(), SchedulerError> {
        if !self.shared.db.set_source_active(id, true).await? {
            return Err(SchedulerError::SourceNotFound { id });
        }
        info!(source_id = id, "Source activated");
        self.trigger_now(id).await?;
        Ok(())
    }

    /// Mark a source inactive. A fetch already running is left to finish.
    pub async fn deactivate(&self, id: SourceId) -> Result<(), SchedulerError> {
        if !self.shared.db.set_source_active(id, false).await? {
            return Err(SchedulerError::SourceNotFound { id });
        }
        info!(source_id = id, "Source deactivated");
        Ok(())
    }

    /// Fetch one source now, without changing its active flag.
    ///
    /// Returns false if a fetch of that source is already in flight.
    pub async fn trigger_now(&self, id: SourceId) -> Result<bool, SchedulerError> {
        let source = self
            .shared
            .db
            .get_source(id)
            .await?
            .ok_or(SchedulerError::SourceNotFound { id })?;
        Ok(self.shared.dispatch(source))
    }

    /// Submit every due active source. Returns how many were accepted.
    pub async fn evaluate_due(&self) -> Result<usize, DatabaseError> {
        self.shared.evaluate_due().await
    }

    /// Run the daily maintenance action if its time has come today.
    /// Returns true if it ran and succeeded.
    pub async fn run_maintenance_if_due(&self) -> bool {
        self.shared.run_maintenance_if_due().await
    }
}

impl Shared {
    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let eval_every = self.config.eval_every_ticks.max(1);
        let mut ticks: u32 = 0;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if ticks % eval_every == 0 {
                let pass = Arc::clone(&self);
                let outcome = tokio::spawn(async move {
                    let dispatched = pass.evaluate_due().await;
                    pass.run_maintenance_if_due().await;
                    dispatched
                })
                .await;

                match outcome {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => debug!(dispatched = n, "Due sources dispatched"),
                    Ok(Err(e)) => error!("Source evaluation failed: {e}"),
                    Err(e) => error!("Evaluation pass aborted: {e}"),
                }
            }
            ticks = ticks.wrapping_add(1);
        }

        debug!("Source scheduler loop exited");
    }

    async fn evaluate_due(self: &Arc<Self>) -> Result<usize, DatabaseError> {
        let now = Utc::now();
        let sources = self.db.list_active_sources().await?;

        let mut dispatched = 0;
        for source in sources {
            if is_due(&source, now) && self.dispatch(source) {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    fn dispatch(self: &Arc<Self>, source: Source) -> bool {
        let id = source.id;
        let shared = Arc::clone(self);
        let accepted = self.pool.submit(id, async move { shared.fetch_source(source).await });
        if !accepted {
            debug!(source_id = id, "Fetch already in flight, skipping");
        }
        accepted
    }

    async fn fetch_source(&self, source: Source) {
        info!(source_id = source.id, name = %source.name, "Fetching source");

        match self.fetcher.fetch(&source).await {
            Ok(outcome) => {
                let mut enqueued = 0;
                for follow_up in &outcome.follow_ups {
                    match self.db.enqueue_work(&follow_up.queue, &follow_up.payload_ref).await {
                        Ok(_) => enqueued += 1,
                        Err(e) => warn!(
                            source_id = source.id,
                            queue = %follow_up.queue,
                            "Failed to enqueue follow-up: {e}"
                        ),
                    }
                }
                info!(
                    source_id = source.id,
                    new_items = outcome.new_items,
                    enqueued,
                    "Fetch finished"
                );
            }
            Err(e) => warn!(source_id = source.id, "Fetch failed: {e}"),
        }

        // Written on failure too, so a broken source waits a full interval.
        if let Err(e) = self.db.set_last_fetch_time(source.id, Utc::now()).await {
            error!(source_id = source.id, "Failed to record fetch time: {e}");
        }
    }

    async fn run_maintenance_if_due(&self) -> bool {
        let Some(task) = &self.maintenance else {
            return false;
        };

        let now = Local::now().naive_local();
        if !self.lock_daily().is_due(now) {
            return false;
        }

        info!(task = task.name(), "Running daily maintenance");
        match task.run().await {
            Ok(()) => {
                self.lock_daily().mark_ran(now.date());
                info!(task = task.name(), "Daily maintenance finished");
                true
            }
            Err(e) => {
                self.lock_daily().mark_failed(now);
                warn!(task = task.name(), "Daily maintenance failed: {e}");
                false
            }
        }
    }

    fn lock_daily(&self) -> std::sync::MutexGuard<'_, DailyTrigger> {
        self.daily.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
