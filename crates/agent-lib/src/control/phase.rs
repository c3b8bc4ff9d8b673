//! Per-dimension actuator lifecycle
//!
//! ```text
//! Idle ──command──▶ Actuating ──confirmed──▶ Steady
//!                      │                        │
//!                   failed                 health check
//!                      ▼                      failed
//!                    Idle                       ▼
//!                               Recovering ◀── Degraded
//!                                 │   │
//!                       restarted │   │ restart failed
//!                                 ▼   ▼
//!                            Steady   Degraded
//! ```
//!
//! Any phase returns to Idle on an explicit stop; emergency shutdown is a
//! stop that bypasses graceful sequencing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of one dimension's actuators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorPhase {
    /// Nothing commanded
    #[default]
    Idle,
    /// Command issued, waiting for the actuator to confirm
    Actuating,
    /// Actuator alive and matching the last command
    Steady,
    /// Actuator died unexpectedly
    Degraded,
    /// Restart attempted
    Recovering,
}

/// Inputs that move the phase machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Command,
    Confirmed,
    StartFailed,
    HealthCheckFailed,
    RecoveryStarted,
    Recovered,
    RecoveryFailed,
    Stop,
    Emergency,
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ActuatorPhase,
    pub event: PhaseEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition {:?} on {:?}", self.from, self.event)
    }
}

impl std::error::Error for InvalidTransition {}

impl ActuatorPhase {
    /// Phase after `event`, if the transition is allowed
    pub fn on(self, event: PhaseEvent) -> Result<ActuatorPhase, InvalidTransition> {
        use ActuatorPhase::*;
        use PhaseEvent::*;

        let next = match (self, event) {
            (_, Stop) | (_, Emergency) => Idle,
            (Idle | Steady, Command) => Actuating,
            (Actuating, Confirmed) => Steady,
            (Actuating, StartFailed) => Idle,
            (Steady, HealthCheckFailed) => Degraded,
            (Degraded, RecoveryStarted) => Recovering,
            (Recovering, Recovered) => Steady,
            (Recovering, RecoveryFailed) => Degraded,
            _ => return Err(InvalidTransition { from: self, event }),
        };
        Ok(next)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ActuatorPhase::Degraded | ActuatorPhase::Recovering)
    }
}

impl fmt::Display for ActuatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActuatorPhase::Idle => "idle",
            ActuatorPhase::Actuating => "actuating",
            ActuatorPhase::Steady => "steady",
            ActuatorPhase::Degraded => "degraded",
            ActuatorPhase::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ActuatorPhase::*;
    use super::PhaseEvent::*;
    use super::*;

    #[test]
    fn test_happy_path() {
        let phase = Idle.on(Command).unwrap();
        assert_eq!(phase, Actuating);
        let phase = phase.on(Confirmed).unwrap();
        assert_eq!(phase, Steady);
        // Re-actuation from steady
        assert_eq!(phase.on(Command).unwrap(), Actuating);
    }

    #[test]
    fn test_recovery_cycle() {
        let phase = Steady.on(HealthCheckFailed).unwrap();
        assert_eq!(phase, Degraded);
        let phase = phase.on(RecoveryStarted).unwrap();
        assert_eq!(phase, Recovering);
        assert_eq!(phase.on(Recovered).unwrap(), Steady);
        assert_eq!(phase.on(RecoveryFailed).unwrap(), Degraded);
    }

    #[test]
    fn test_stop_and_emergency_from_anywhere() {
        for phase in [Idle, Actuating, Steady, Degraded, Recovering] {
            assert_eq!(phase.on(Stop).unwrap(), Idle);
            assert_eq!(phase.on(Emergency).unwrap(), Idle);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(Idle.on(Confirmed).is_err());
        assert!(Idle.on(HealthCheckFailed).is_err());
        assert!(Degraded.on(Command).is_err());
        assert!(Steady.on(Recovered).is_err());
    }

    #[test]
    fn test_start_failure_returns_to_idle() {
        assert_eq!(Actuating.on(StartFailed).unwrap(), Idle);
    }
}
