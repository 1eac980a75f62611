//! dispatch-placement — where a queued unit may run.
//!
//! Pure decision logic with no store access: the scheduler gathers live
//! machines and their assigned units, this crate filters and ranks them.
//!
//! - **`rules`** — per-machine qualification (ports, density, tags)
//! - **`placer`** — lowest-load selection among qualifying machines

pub mod placer;
pub mod rules;

pub use placer::select_machine;
pub use rules::{MachineCandidate, PlacementRequest, Rejection, UnitFootprint, evaluate};
