//! System utilisation sampling
//!
//! This module reads cumulative CPU and network counters and turns
//! successive snapshots into instantaneous rates. The procfs source is the
//! production implementation; tests plug in their own [`CounterSource`].

mod procfs;
mod rate;
mod r#loop;


pub use procfs::ProcfsSource;
pub use r#loop::{SamplingConfig, SamplingLoop, SamplingLoopBuilder};
pub use rate::{cpu_percent, mbps, Sampler};

use crate::error::ControlResult;
use crate::models::{CpuTicks, NetBytes};
use std::path::Path;
use std::sync::Arc;

pub use async_trait::async_trait;

/// Trait for raw counter readers
#[async_trait]
pub trait CounterSource: Send + Sync {
    /// Read the cumulative CPU time buckets
    async fn read_cpu(&self) -> ControlResult<CpuTicks>;

    /// Read the cumulative network byte counters
    async fn read_net(&self) -> ControlResult<NetBytes>;
}

/// Create the procfs-backed counter source
pub fn create_source(proc_path: &Path, interface: Option<&str>) -> Arc<dyn CounterSource> {
    let source = ProcfsSource::new(proc_path);
    match interface {
        Some(iface) => {
            tracing::info!(interface = %iface, "Sampling network counters for a single interface");
            Arc::new(source.with_interface(iface))
        }
        None => Arc::new(source),
    }
}
