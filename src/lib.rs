//! feedflow: source polling, work queues and worker orchestration.

pub mod adapters;
pub mod config;
pub mod error;
pub mod ingest;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod store;
