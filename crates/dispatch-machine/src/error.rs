//! Machine agent error types.

use dispatch_store::StoreError;
use dispatch_unit::UnitError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unit error: {0}")]
    Unit(#[from] UnitError),

    #[error("failed to sample load: {0}")]
    Load(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MachineResult<T> = Result<T, MachineError>;
