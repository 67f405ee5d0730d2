//! MicroVM state machine and spec validation.
//!
//! The allowed lifecycle is `creating → {stopped, error}`,
//! `stopped ↔ running`, and `{stopped, running, error} → deleting`.
//! Everything else is rejected; callers that observe a forbidden
//! transition from the field store `error` with an
//! `invalid_transition` marker instead.

use serde::{Deserialize, Serialize};

use crate::error::{SpecError, TransitionError};

/// Minimum guest memory accepted, in MiB.
pub const MIN_MEMORY_MIB: u64 = 64;

/// Marker recorded when a reported transition violates the machine.
pub const INVALID_TRANSITION: &str = "invalid_transition";

/// Lifecycle state of a microVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Creating,
    Stopped,
    Running,
    Deleting,
    Error,
}

impl VmState {
    /// Whether `self → to` is an allowed transition.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Creating, Self::Stopped | Self::Error)
                | (Self::Stopped, Self::Running | Self::Deleting)
                | (Self::Running, Self::Stopped | Self::Deleting)
                | (Self::Error, Self::Deleting)
        )
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Deleting => "deleting",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "deleting" => Ok(Self::Deleting),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown vm state: {other}")),
        }
    }
}

/// Validate a requested transition, keeping no-ops legal.
///
/// # Errors
///
/// Returns [`TransitionError::Invalid`] when `from → to` is outside the
/// allowed set and not a self-transition.
pub fn validate_transition(from: VmState, to: VmState) -> Result<(), TransitionError> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(TransitionError::Invalid { from, to })
    }
}

/// Resources and identity requested for a new microVM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub vcpu_count: u32,
    pub memory_mib: u64,
}

impl VmSpec {
    /// Validate against the host's vCPU limit.
    ///
    /// # Errors
    ///
    /// Returns the first [`SpecError`] encountered.
    pub fn validate(&self, host_vcpu_limit: u32) -> Result<(), SpecError> {
        if self.name.trim().is_empty() {
            return Err(SpecError::Name {
                reason: "name is empty".to_owned(),
            });
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(SpecError::Name {
                reason: format!("'{}' contains invalid characters", self.name),
            });
        }
        if self.vcpu_count == 0 || self.vcpu_count > host_vcpu_limit {
            return Err(SpecError::Vcpu {
                requested: self.vcpu_count,
                limit: host_vcpu_limit,
            });
        }
        if self.memory_mib < MIN_MEMORY_MIB {
            return Err(SpecError::Memory {
                requested: self.memory_mib,
                minimum: MIN_MEMORY_MIB,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const ALL: [VmState; 5] = [
        VmState::Creating,
        VmState::Stopped,
        VmState::Running,
        VmState::Deleting,
        VmState::Error,
    ];

    #[test]
    fn allowed_set_is_exactly_the_specified_one() {
        let allowed = [
            (VmState::Creating, VmState::Stopped),
            (VmState::Creating, VmState::Error),
            (VmState::Stopped, VmState::Running),
            (VmState::Stopped, VmState::Deleting),
            (VmState::Running, VmState::Stopped),
            (VmState::Running, VmState::Deleting),
            (VmState::Error, VmState::Deleting),
        ];
        for from in ALL {
            for to in ALL {
                let expected = from == to || allowed.contains(&(from, to));
                assert_eq!(
                    validate_transition(from, to).is_ok(),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn deleting_is_terminal() {
        for to in ALL {
            if to != VmState::Deleting {
                assert!(validate_transition(VmState::Deleting, to).is_err());
            }
        }
    }

    #[test]
    fn state_roundtrips_through_strings() {
        for state in ALL {
            assert_eq!(state.to_string().parse::<VmState>().unwrap(), state);
        }
        assert!("paused".parse::<VmState>().is_err());
    }

    #[test]
    fn spec_validation() {
        let ok = VmSpec {
            name: "web-1".to_owned(),
            vcpu_count: 2,
            memory_mib: 256,
        };
        assert!(ok.validate(8).is_ok());

        let mut bad = ok.clone();
        bad.name = String::new();
        assert!(matches!(bad.validate(8), Err(SpecError::Name { .. })));

        let mut bad = ok.clone();
        bad.name = "has space".to_owned();
        assert!(matches!(bad.validate(8), Err(SpecError::Name { .. })));

        let mut bad = ok.clone();
        bad.vcpu_count = 16;
        assert!(matches!(bad.validate(8), Err(SpecError::Vcpu { .. })));

        let mut bad = ok.clone();
        bad.vcpu_count = 0;
        assert!(matches!(bad.validate(8), Err(SpecError::Vcpu { .. })));

        let mut bad = ok;
        bad.memory_mib = 32;
        assert!(matches!(bad.validate(8), Err(SpecError::Memory { .. })));
    }
}
