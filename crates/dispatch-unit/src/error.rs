//! Unit error types.

use dispatch_store::StoreError;
use thiserror::Error;

use crate::process::ProcessError;

/// Errors that can occur while managing units and templates.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("unit name must not be empty")]
    EmptyName,

    #[error("unit record {0} is corrupt: {1}")]
    Corrupt(String, String),

    #[error("template name {0} must contain exactly one '*'")]
    InvalidTemplateName(String),

    #[error("failed to render template {template}: {detail}")]
    Render { template: String, detail: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("process supervisor error: {0}")]
    Process(#[from] ProcessError),

    #[error("unit file error: {0}")]
    Io(#[from] std::io::Error),
}

pub type UnitResult<T> = Result<T, UnitError>;
