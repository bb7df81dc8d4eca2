//! Error types for shared-state operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid stored value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Shared store backend error: {0}")]
    Backend(String),
}
