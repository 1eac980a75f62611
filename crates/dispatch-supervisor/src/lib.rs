//! dispatch-supervisor — zone-wide control, run by one elected machine.
//!
//! # Architecture
//!
//! ```text
//! Supervisor (election, every machine)
//!   └── while Leader:
//!         ├── FailureDetector   watch machines/ → requeue units of dead machines
//!         ├── GlobalPropagator  watch globals/  → mirror global units everywhere
//!         └── Scheduler         timer + watch queue/ → assign queued units
//! ```
//!
//! Leader-only subsystems never run on two machines at once: they are
//! started after winning the vote and stopped as soon as the supervisor
//! lease is lost. Every write they make is idempotent, so a pass cut
//! short by a leader change is simply redone by the next leader.

pub mod detector;
pub mod election;
pub mod error;
pub mod globals;
pub mod queue;
pub mod scheduler;

pub use detector::FailureDetector;
pub use election::{Role, Supervisor, SupervisorConfig};
pub use error::{SupervisorError, SupervisorResult};
pub use globals::GlobalPropagator;
pub use queue::UnitQueue;
pub use scheduler::{Placement, Scheduler};
