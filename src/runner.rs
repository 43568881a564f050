//! Sequential low-CPU runner.
//!
//! Instead of concurrent worker loops, each cycle gives every worker one
//! `run_once` turn in order, then pauses. Useful on small machines where the
//! processing endpoints share the host.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::queue::worker_loop::sleep_or_shutdown;
use crate::queue::{ItemReport, WorkerLoop};

pub struct SequentialRunner {
    steps: Vec<Arc<WorkerLoop>>,
    pause: Duration,
}

impl SequentialRunner {
    /// `steps` run in the given order within each cycle.
    pub fn new(steps: Vec<Arc<WorkerLoop>>, pause: Duration) -> Self {
        Self { steps, pause }
    }

    /// One pass over every step. Returns the items handled.
    pub async fn run_cycle(&self) -> Vec<ItemReport> {
        let mut reports = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            let queue = step.queue().name();
            debug!(step = i + 1, of = self.steps.len(), queue = %queue, "Running step");

            match step.run_once().await {
                Some(report) => {
                    info!(queue = %queue, item_id = report.item_id, disposition = ?report.disposition, "Step handled item");
                    reports.push(report);
                }
                None => debug!(queue = %queue, "Nothing to do"),
            }
        }
        reports
    }

    /// Cycle until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(steps = self.steps.len(), pause = ?self.pause, "Sequential runner started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.run_cycle().await;
            self.log_stats().await;

            if sleep_or_shutdown(&mut shutdown, self.pause).await {
                break;
            }
        }

        info!("Sequential runner stopped");
    }

    async fn log_stats(&self) {
        for step in &self.steps {
            match step.queue().stats().await {
                Ok(s) => debug!(
                    queue = %step.queue().name(),
                    pending = s.pending,
                    processing = s.processing,
                    failed = s.failed,
                    completed = s.completed,
                    "Queue stats"
                ),
                Err(e) => warn!(queue = %step.queue().name(), "Failed to read queue stats: {e}"),
            }
        }
    }
}
