//! Error types for the ingest pipeline.
//!
//! ## Error Categories
//!
//! ### Transient downstream failures
//! - `ObjectStore` / `UploadFailed`: object-store puts; the buffer is kept
//!   and the offset floor does not advance, so the next tick retries
//! - `State`: shared-store reads/writes
//! - `Commit` / `Publish`: message-bus side effects
//!
//! ### Local failures
//! - `Io`: temp-file handling in session buffers
//! - `Json`: event serialization
//!
//! ## Usage
//!
//! All ingest operations return `Result<T>` aliased to `Result<T, Error>`.
//! Per-message failures never abort a batch; per-session flush failures
//! never block other sessions.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shared state error: {0}")]
    State(#[from] rewind_state::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Upload failed after retries: {0}")]
    UploadFailed(String),

    #[error("Offset commit failed: {0}")]
    Commit(String),

    #[error("Downstream publish failed: {0}")]
    Publish(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Refresh failed: {0}")]
    Refresh(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
