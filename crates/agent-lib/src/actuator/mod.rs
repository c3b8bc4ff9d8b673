//! Synthetic load actuators
//!
//! The controller only depends on the [`Actuator`] contract: start a load
//! generator for a command, stop it, and ask whether it is still alive.
//! [`ProcessActuator`] drives external tools (`stress-ng`, `curl`).

mod process;

pub use process::{find_on_path, ProcessActuator, ProcessActuatorConfig};

use crate::error::ControlResult;
use crate::models::{BandwidthCommand, CpuCommand, Dimension};
use async_trait::async_trait;
use url::Url;

/// Opaque reference to one running load generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActuatorHandle {
    pub id: u64,
    pub dimension: Dimension,
    /// OS process id when the generator is a process
    pub pid: Option<u32>,
}

/// Start/stop contract for load generators
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Start CPU workers for `command`
    async fn start_cpu(&self, command: &CpuCommand) -> ControlResult<ActuatorHandle>;

    /// Gracefully stop a CPU generator
    async fn stop_cpu(&self, handle: ActuatorHandle) -> ControlResult<()>;

    /// Start one downloader per `command.downloaders`, URLs chosen round-robin
    async fn start_bandwidth(
        &self,
        command: &BandwidthCommand,
        url_pool: &[Url],
    ) -> ControlResult<Vec<ActuatorHandle>>;

    /// Gracefully stop downloaders
    async fn stop_bandwidth(&self, handles: Vec<ActuatorHandle>) -> ControlResult<()>;

    /// Whether the generator behind `handle` is still running
    async fn is_alive(&self, handle: &ActuatorHandle) -> bool;

    /// Immediately kill every generator this actuator started
    async fn kill_all(&self);
}
