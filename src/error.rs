//! Error types for feedflow.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Errors raised by a content fetch collaborator.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Could not parse document from {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("Fetch of {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}

/// Errors surfaced through the operator control surface.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Source {id} not found")]
    SourceNotFound { id: i64 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
