//! Error types for the coordination store.

use thiserror::Error;

use crate::store::LeaseId;

/// Result type alias for coordination store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to coordination store: {0}")]
    Connect(String),

    #[error("store request failed: {0}")]
    Request(String),

    #[error("lease {0:x} not found or expired")]
    LeaseNotFound(LeaseId),

    #[error("key or value is not valid utf-8: {0}")]
    Encoding(String),

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),
}
