//! Closed-loop load control
//!
//! Pure decision logic (decomposition, gap, clamp, translation) lives in
//! its own modules so it can be exercised without actuators; the
//! [`Controller`] wires it to the shared state and the actuators.

pub mod controller;
pub mod decompose;
pub mod gap;
pub mod phase;
pub mod translate;

pub use controller::{ControlCommand, Controller, CycleOutcome};
pub use decompose::{decompose, organic, Decomposition, LoadSplit};
pub use gap::{gap, plan_adjustment, should_adjust, Adjustment, SafetyClamp};
pub use phase::{ActuatorPhase, PhaseEvent};
pub use translate::{translate_bandwidth, translate_cpu, ParameterTranslator};
