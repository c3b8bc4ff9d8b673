//! Subcommand implementations

pub mod health;
pub mod metrics;
pub mod plan;
pub mod status;
