//! Closed-loop synthetic load controller
//!
//! This crate provides the core functionality for:
//! - Sampling CPU and network utilisation from procfs
//! - Decomposing measured load into organic and synthetic parts
//! - Gap calculation, safety clamping and actuator parameter translation
//! - Supervising the external load-generating processes
//! - The shared synthetic-load state record
//! - Health checks, observability and the HTTP API

pub mod actuator;
pub mod api;
pub mod control;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod report;
pub mod sampler;
pub mod settings;
pub mod state;

pub use error::{ControlError, ControlResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use settings::LoadSettings;
pub use state::{StateSnapshot, StateStore};
