//! Target selection — lowest load among qualifying machines.

use tracing::debug;

use crate::rules::{MachineCandidate, PlacementRequest, evaluate};

/// Pick the qualifying machine with the lowest load.
///
/// Ties go to the machine observed first. `None` means the request is
/// currently unsatisfiable and should stay queued.
pub fn select_machine<'a>(
    machines: &'a [MachineCandidate],
    req: &PlacementRequest,
) -> Option<&'a MachineCandidate> {
    let mut best: Option<&MachineCandidate> = None;
    for machine in machines {
        if let Err(reason) = evaluate(machine, req) {
            debug!(unit = %req.unit, machine = %machine.name, %reason, "machine disqualified");
            continue;
        }
        match best {
            Some(current) if current.load <= machine.load => {}
            _ => best = Some(machine),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::rules::UnitFootprint;

    fn candidate(name: &str, load: f64, units: Vec<UnitFootprint>) -> MachineCandidate {
        MachineCandidate {
            name: name.into(),
            load,
            tags: BTreeMap::new(),
            units,
        }
    }

    fn request(unit: &str, ports: &[u16]) -> PlacementRequest {
        PlacementRequest {
            unit: unit.into(),
            ports: ports.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn lowest_load_wins() {
        let machines = vec![candidate("m2", 0.5, vec![]), candidate("m1", 0.2, vec![])];
        let chosen = select_machine(&machines, &request("u1.service", &[80])).unwrap();
        assert_eq!(chosen.name, "m1");
    }

    #[test]
    fn port_conflict_moves_to_next_machine() {
        let holder = UnitFootprint {
            name: "u1.service".into(),
            template: None,
            ports: [80].into_iter().collect(),
        };
        let machines = vec![
            candidate("m1", 0.2, vec![holder]),
            candidate("m2", 0.5, vec![]),
        ];
        let chosen = select_machine(&machines, &request("u2.service", &[80])).unwrap();
        assert_eq!(chosen.name, "m2");
    }

    #[test]
    fn ties_keep_first_observed() {
        let machines = vec![
            candidate("a", 0.3, vec![]),
            candidate("b", 0.3, vec![]),
            candidate("c", 0.4, vec![]),
        ];
        assert_eq!(select_machine(&machines, &request("u.service", &[])).unwrap().name, "a");
    }

    #[test]
    fn nothing_qualifies() {
        let holder = UnitFootprint {
            name: "u1.service".into(),
            template: None,
            ports: [80].into_iter().collect(),
        };
        let machines = vec![candidate("m1", 0.2, vec![holder])];
        assert!(select_machine(&machines, &request("u2.service", &[80])).is_none());
        assert!(select_machine(&[], &request("u2.service", &[])).is_none());
    }
}
