//! Key layout of the coordination store.
//!
//! Everything lives under `/dispatch/{zone}/`:
//!
//! ```text
//! machines/{m}/{arch|ip|load|alive|tags}     machine record, `alive` is lease-bound
//! machines/{m}/units/{u}                     assignment membership
//! units/{u}/{name|machine|template|global|desiredState|state|ports|constraints|unit}
//! templates/{t}/{name|unit|maxpermachine|ports|constraints}
//! queue/{u}                                  pending placement
//! globals/{u}                                global unit declarations
//! vote                                       election vote, lease-bound
//! supervisor/{alive|machine}                 elected supervisor, lease-bound
//! ```
//!
//! Values are plain text. Prefix helpers end with `/` so that a prefix
//! read for `u1` never matches `u10`.

/// Root of the key space.
pub const ROOT: &str = "/dispatch";

// ── Machine fields ─────────────────────────────────────────────

pub const MACHINE_ARCH: &str = "arch";
pub const MACHINE_IP: &str = "ip";
pub const MACHINE_LOAD: &str = "load";
pub const MACHINE_ALIVE: &str = "alive";
pub const MACHINE_TAGS: &str = "tags";
pub const MACHINE_UNITS: &str = "units";

// ── Unit fields ────────────────────────────────────────────────

pub const UNIT_NAME: &str = "name";
pub const UNIT_MACHINE: &str = "machine";
pub const UNIT_TEMPLATE: &str = "template";
pub const UNIT_GLOBAL: &str = "global";
pub const UNIT_DESIRED_STATE: &str = "desiredState";
pub const UNIT_STATE: &str = "state";
pub const UNIT_PORTS: &str = "ports";
pub const UNIT_CONSTRAINTS: &str = "constraints";
pub const UNIT_CONTENT: &str = "unit";

// ── Template fields ────────────────────────────────────────────

pub const TEMPLATE_NAME: &str = "name";
pub const TEMPLATE_CONTENT: &str = "unit";
pub const TEMPLATE_MAX_PER_MACHINE: &str = "maxpermachine";
pub const TEMPLATE_PORTS: &str = "ports";
pub const TEMPLATE_CONSTRAINTS: &str = "constraints";

/// Key builder for one zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    zone: String,
    base: String,
}

impl Keyspace {
    pub fn new(zone: &str) -> Self {
        Self {
            zone: zone.to_string(),
            base: format!("{ROOT}/{zone}"),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    // ── Machines ───────────────────────────────────────────────

    pub fn machines(&self) -> String {
        format!("{}/machines/", self.base)
    }

    pub fn machine(&self, machine: &str) -> String {
        format!("{}/machines/{machine}/", self.base)
    }

    pub fn machine_field(&self, machine: &str, field: &str) -> String {
        format!("{}/machines/{machine}/{field}", self.base)
    }

    pub fn machine_alive(&self, machine: &str) -> String {
        self.machine_field(machine, MACHINE_ALIVE)
    }

    pub fn machine_units(&self, machine: &str) -> String {
        format!("{}/machines/{machine}/{MACHINE_UNITS}/", self.base)
    }

    pub fn machine_unit(&self, machine: &str, unit: &str) -> String {
        format!("{}/machines/{machine}/{MACHINE_UNITS}/{unit}", self.base)
    }

    /// Machine name when `key` is exactly a machine's `alive` key.
    pub fn alive_key_machine<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key.strip_prefix(self.machines().as_str())?;
        let (machine, field) = rest.split_once('/')?;
        (field == MACHINE_ALIVE && !machine.is_empty()).then_some(machine)
    }

    // ── Units ──────────────────────────────────────────────────

    pub fn units(&self) -> String {
        format!("{}/units/", self.base)
    }

    pub fn unit(&self, unit: &str) -> String {
        format!("{}/units/{unit}/", self.base)
    }

    pub fn unit_field(&self, unit: &str, field: &str) -> String {
        format!("{}/units/{unit}/{field}", self.base)
    }

    // ── Templates ──────────────────────────────────────────────

    pub fn templates(&self) -> String {
        format!("{}/templates/", self.base)
    }

    pub fn template(&self, template: &str) -> String {
        format!("{}/templates/{template}/", self.base)
    }

    pub fn template_field(&self, template: &str, field: &str) -> String {
        format!("{}/templates/{template}/{field}", self.base)
    }

    // ── Queue, globals, election ───────────────────────────────

    pub fn queue(&self) -> String {
        format!("{}/queue/", self.base)
    }

    pub fn queue_entry(&self, unit: &str) -> String {
        format!("{}/queue/{unit}", self.base)
    }

    pub fn globals(&self) -> String {
        format!("{}/globals/", self.base)
    }

    pub fn global(&self, unit: &str) -> String {
        format!("{}/globals/{unit}", self.base)
    }

    pub fn vote(&self) -> String {
        format!("{}/vote", self.base)
    }

    pub fn supervisor_alive(&self) -> String {
        format!("{}/supervisor/alive", self.base)
    }

    pub fn supervisor_machine(&self) -> String {
        format!("{}/supervisor/machine", self.base)
    }
}

/// First path segment of `key` below `prefix`.
///
/// `child_name("/d/z/units/", "/d/z/units/web.service/ports")` is
/// `Some("web.service")`.
pub fn child_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    let name = rest.split('/').next()?;
    (!name.is_empty()).then_some(name)
}

/// Path segment after the last `/`.
pub fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
