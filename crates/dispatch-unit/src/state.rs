//! Unit lifecycle states.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Lifecycle phase of a unit, used for both desired and observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UnitState {
    Active,
    #[default]
    Dead,
    Starting,
    /// Terminal: tear down and remove all persisted state.
    Destroy,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Dead => "dead",
            Self::Starting => "starting",
            Self::Destroy => "destroy",
        }
    }

    /// Parse a stored state. Unknown values read as `Dead`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "active" => Self::Active,
            "starting" => Self::Starting,
            "destroy" => Self::Destroy,
            _ => Self::Dead,
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitState {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_states_parse() {
        for state in [
            UnitState::Active,
            UnitState::Dead,
            UnitState::Starting,
            UnitState::Destroy,
        ] {
            assert_eq!(UnitState::parse(state.as_str()), state);
        }
    }

    #[test]
    fn unknown_state_is_dead() {
        assert_eq!(UnitState::parse("exploding"), UnitState::Dead);
        assert_eq!(UnitState::parse(""), UnitState::Dead);
        assert_eq!("active".parse::<UnitState>(), Ok(UnitState::Active));
    }
}
