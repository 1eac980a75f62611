//! Supervisor error types.

use dispatch_store::StoreError;
use dispatch_unit::UnitError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unit error: {0}")]
    Unit(#[from] UnitError),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
