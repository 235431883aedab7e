//! Error types for kernel-worker.

use thiserror::Error;

use crate::store::Rejection;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// The store refused a commit because the log had moved on.
    #[error("commit rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session registration failed: {0}")]
    Registration(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("store is closed")]
    StoreClosed,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
