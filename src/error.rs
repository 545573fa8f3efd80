//! Error types for the sync pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while syncing the catalog into the index.
#[derive(Error, Debug)]
pub enum Error {
    /// Postgres error (connection, query, or row decode).
    #[error("Postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Elasticsearch transport error.
    #[error("Elasticsearch error: {0}")]
    Elastic(#[from] reqwest::Error),

    /// Elasticsearch rejected an index operation.
    #[error("Index error: {0}")]
    Index(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Document failed schema validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Watermark store error.
    #[error("Watermark store error: {0}")]
    State(String),

    /// Retries exhausted (bounded retry variant only).
    #[error("Retries exhausted for {operation} after {attempts} attempts")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
    },
}
