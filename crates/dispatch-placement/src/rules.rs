//! Machine qualification rules.
//!
//! A machine qualifies for a unit when:
//! - **Ports**: no unit assigned to it holds any of the requested ports
//! - **Density**: it holds fewer than `max_per_machine` units of the
//!   same template (0 = unlimited)
//! - **Constraints**: every requested `key=value` matches a machine tag

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What an assigned unit occupies on its machine.
#[derive(Debug, Clone, Default)]
pub struct UnitFootprint {
    pub name: String,
    pub template: Option<String>,
    pub ports: BTreeSet<u16>,
}

/// A live machine as seen by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct MachineCandidate {
    pub name: String,
    /// Published load average.
    pub load: f64,
    pub tags: BTreeMap<String, String>,
    /// Units currently assigned to the machine.
    pub units: Vec<UnitFootprint>,
}

/// Placement needs of one unit.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub unit: String,
    pub ports: BTreeSet<u16>,
    pub template: Option<String>,
    /// Density limit of the template, 0 for unlimited.
    pub max_per_machine: u32,
    pub constraints: BTreeMap<String, String>,
}

/// Why a machine was disqualified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    PortConflict { port: u16, holder: String },
    DensityLimit { template: String, count: u32, limit: u32 },
    ConstraintMismatch { key: String, wanted: String },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortConflict { port, holder } => write!(f, "port {port} held by {holder}"),
            Self::DensityLimit { template, count, limit } => {
                write!(f, "{count} of {limit} {template} units already placed")
            }
            Self::ConstraintMismatch { key, wanted } => write!(f, "tag {key} is not {wanted}"),
        }
    }
}

/// Check whether `machine` may receive the requested unit.
///
/// A footprint with the unit's own name is ignored, so re-evaluating an
/// already assigned unit never conflicts with itself.
pub fn evaluate(machine: &MachineCandidate, req: &PlacementRequest) -> Result<(), Rejection> {
    for (key, wanted) in &req.constraints {
        if machine.tags.get(key) != Some(wanted) {
            return Err(Rejection::ConstraintMismatch {
                key: key.clone(),
                wanted: wanted.clone(),
            });
        }
    }

    let others = machine.units.iter().filter(|u| u.name != req.unit);

    let mut same_template = 0u32;
    for unit in others {
        if let Some(port) = unit.ports.intersection(&req.ports).next() {
            return Err(Rejection::PortConflict {
                port: *port,
                holder: unit.name.clone(),
            });
        }
        if req.template.is_some() && unit.template == req.template {
            same_template += 1;
        }
    }

    if let Some(template) = &req.template {
        if req.max_per_machine > 0 && same_template >= req.max_per_machine {
            return Err(Rejection::DensityLimit {
                template: template.clone(),
                count: same_template,
                limit: req.max_per_machine,
            });
        }
    }

    Ok(())
}
