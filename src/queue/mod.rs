//! Durable work queue and the generic worker loop that drains it.

pub mod model;
pub mod work_queue;
pub mod worker_loop;

pub use model::{QueueName, QueueStats, WorkItem, WorkItemId, WorkStatus};
pub use work_queue::WorkQueue;
pub use worker_loop::{Disposition, ItemReport, ProcessOutcome, Processor, WorkerLoop};
