//! Path lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::ConfigError;

/// Lifecycle state of a path.
///
/// ```text
/// Empty ──► Down ◄──► Backup
///            ▲          ▲
///            └──► Up ◄──┘
/// ```
///
/// `Empty` is only the free-slot marker: a path leaves it once and never
/// returns to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PathState {
    /// Unused slot.
    #[default]
    Empty,
    /// Known but not carrying traffic.
    Down,
    /// Carries traffic only when no UP path is healthy.
    Backup,
    /// Carries traffic.
    Up,
}

impl PathState {
    /// Upper-case name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            PathState::Empty => "EMPTY",
            PathState::Down => "DOWN",
            PathState::Backup => "BACKUP",
            PathState::Up => "UP",
        }
    }

    /// Check if the path may carry payload in this state.
    pub fn is_active(self) -> bool {
        matches!(self, PathState::Backup | PathState::Up)
    }

    /// Check if the state machine allows moving to `to`.
    ///
    /// Staying in a non-empty state is always allowed.
    pub fn can_transition_to(self, to: PathState) -> bool {
        use PathState::*;

        match (self, to) {
            (_, Empty) => false,
            (Empty, Down) => true,
            (Empty, _) => false,
            (Down | Backup | Up, _) => true,
        }
    }

    /// Move to `to`, or report the transition as illegal and stay put.
    pub fn transition(&mut self, to: PathState) -> Result<(), ConfigError> {
        if !self.can_transition_to(to) {
            return Err(ConfigError::IllegalTransition {
                from: self.as_str(),
                to: to.as_str(),
            });
        }
        *self = to;
        Ok(())
    }

    /// Decode the state byte carried in control messages.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PathState::Empty),
            1 => Some(PathState::Down),
            2 => Some(PathState::Backup),
            3 => Some(PathState::Up),
            _ => None,
        }
    }

    /// Encode the state for control messages.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
