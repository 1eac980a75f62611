//! dispatch-machine — the per-host agent.
//!
//! ```text
//!   MachineAgent
//!     ├── register ──► machines/{me}/{arch,ip,tags}, alive (leased)
//!     ├── keepalive / load loops
//!     └── UnitTracker ◄── watch machines/{me}/units/
//!             └── Unit::supervise (one task per unit)
//! ```
//!
//! - **`agent`** — registration, lease upkeep, assignment watch, sweep
//! - **`tracker`** — local supervision tasks keyed by unit name
//! - **`record`** — reading machine records back from the store
//! - **`load`** — load average sampling

pub mod agent;
pub mod error;
pub mod load;
pub mod record;
pub mod tracker;

pub use agent::{AgentConfig, MachineAgent};
pub use error::{MachineError, MachineResult};
pub use load::{LoadSource, StaticLoad, SystemLoad};
pub use record::MachineRecord;
pub use tracker::UnitTracker;
