//! Error taxonomy for the load controller
//!
//! Only configuration errors at startup are fatal. Everything else is
//! logged by the loop that observed it and the loop carries on.

use thiserror::Error;

/// Result alias used throughout the library
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors raised by sampling, actuation and state persistence
#[derive(Debug, Error)]
pub enum ControlError {
    /// A counter file was missing or could not be parsed
    #[error("measurement unavailable: {0}")]
    MeasurementUnavailable(String),

    /// A required external load-generation tool is not installed
    #[error("actuator unavailable: {tool} not found on PATH")]
    ActuatorUnavailable { tool: String },

    /// An actuator process exited without being asked to
    #[error("actuator died: {0}")]
    ActuatorDied(String),

    /// Spawning or signalling an actuator process failed
    #[error("actuator failed: {0}")]
    ActuatorFailed(String),

    /// Measured load stayed above a configured maximum for too many cycles
    #[error("safety limit exceeded for {dimension} in {cycles} consecutive cycles")]
    SafetyViolationRepeated { dimension: String, cycles: u32 },

    /// Reading or writing the shared state record failed
    #[error("state store error: {0}")]
    StateStore(String),

    /// Configuration values are inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::StateStore(err.to_string())
    }
}
