//! dispatch-unit — the unit model.
//!
//! # Components
//!
//! - **`unit`** — unit records, local lifecycle and the per-unit
//!   desired-state supervision loop
//! - **`template`** — wildcard templates that instantiate units
//! - **`process`** — the process supervisor contract, a systemd adapter
//!   and a recording double
//! - **`files`** — the runtime directory of materialized unit files
//! - **`state`** — lifecycle states

pub mod error;
pub mod files;
pub mod process;
pub mod state;
pub mod template;
pub mod unit;

pub use error::{UnitError, UnitResult};
pub use files::{DEFAULT_UNIT_DIR, UnitFiles};
pub use process::{
    JobResult, ProcessError, ProcessSupervisor, RecordingSupervisor, SupervisorCall,
    SystemdSupervisor,
};
pub use state::UnitState;
pub use template::Template;
pub use unit::{Unit, UnitContext, normalize_name};
