//! Runtime settings snapshot
//!
//! The agent deserializes this from file and environment layers; the
//! controller holds it behind an `Arc` and swaps it on reload.

use crate::control::translate::DEFAULT_PER_SERVER_EXPECTED_MBPS;
use crate::error::{ControlError, ControlResult};
use crate::models::ControlTarget;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Complete, validated configuration of one loadpilot instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSettings {
    /// Name reported in structured log events
    pub node_name: String,

    pub cpu_target_percent: f64,
    pub bandwidth_target_mbps: f64,
    pub max_cpu_percent: f64,
    pub max_bandwidth_mbps: f64,
    pub min_adjustment_threshold: f64,

    pub monitor_interval_s: f64,
    pub adjustment_interval_s: f64,
    pub report_interval_s: f64,

    /// Download sources, used round-robin
    pub download_url_pool: Vec<Url>,
    pub per_server_expected_mbps: f64,

    /// Consecutive violating cycles before emergency shutdown
    pub safety_violation_limit: u32,
    pub stop_grace_period_s: f64,
    /// 0 means detect
    pub cpu_cores: u32,

    pub state_path: PathBuf,
    pub metrics_path: PathBuf,
    pub proc_path: PathBuf,
    /// Sum every non-loopback interface when unset
    pub network_interface: Option<String>,

    pub cpu_tool: String,
    pub download_tool: String,
    pub api_port: u16,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            cpu_target_percent: 0.0,
            bandwidth_target_mbps: 0.0,
            max_cpu_percent: 90.0,
            max_bandwidth_mbps: 1000.0,
            min_adjustment_threshold: 5.0,
            monitor_interval_s: 1.0,
            adjustment_interval_s: 5.0,
            report_interval_s: 10.0,
            download_url_pool: Vec::new(),
            per_server_expected_mbps: DEFAULT_PER_SERVER_EXPECTED_MBPS,
            safety_violation_limit: 3,
            stop_grace_period_s: 5.0,
            cpu_cores: 0,
            state_path: PathBuf::from("/var/lib/loadpilot/state.json"),
            metrics_path: PathBuf::from("/var/lib/loadpilot/metrics.jsonl"),
            proc_path: PathBuf::from("/proc"),
            network_interface: None,
            cpu_tool: "stress-ng".to_string(),
            download_tool: "curl".to_string(),
            api_port: 9464,
        }
    }
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

impl LoadSettings {
    pub fn target(&self) -> ControlTarget {
        ControlTarget {
            cpu_target_percent: self.cpu_target_percent,
            bandwidth_target_mbps: self.bandwidth_target_mbps,
            max_cpu_percent: self.max_cpu_percent,
            max_bandwidth_mbps: self.max_bandwidth_mbps,
            min_adjustment_threshold: self.min_adjustment_threshold,
        }
    }

    /// Configured core count, or the host's available parallelism
    pub fn effective_cores(&self) -> u32 {
        if self.cpu_cores > 0 {
            return self.cpu_cores;
        }
        std::thread::available_parallelism()
            .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
            .unwrap_or(1)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs_f64(self.monitor_interval_s)
    }

    pub fn adjustment_interval(&self) -> Duration {
        Duration::from_secs_f64(self.adjustment_interval_s)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs_f64(self.report_interval_s)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.stop_grace_period_s)
    }

    /// Reject inconsistent settings before they reach the controller
    pub fn validate(&self) -> ControlResult<()> {
        self.target().validate()?;

        let intervals = [
            ("monitor_interval_s", self.monitor_interval_s),
            ("adjustment_interval_s", self.adjustment_interval_s),
            ("report_interval_s", self.report_interval_s),
        ];
        for (name, value) in intervals {
            if !value.is_finite() || value <= 0.0 {
                return Err(ControlError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.monitor_interval_s >= self.adjustment_interval_s {
            return Err(ControlError::InvalidConfig(format!(
                "monitor_interval_s ({}) must be shorter than adjustment_interval_s ({})",
                self.monitor_interval_s, self.adjustment_interval_s
            )));
        }
        if !self.stop_grace_period_s.is_finite() || self.stop_grace_period_s < 0.0 {
            return Err(ControlError::InvalidConfig(format!(
                "stop_grace_period_s must be non-negative, got {}",
                self.stop_grace_period_s
            )));
        }
        if !self.per_server_expected_mbps.is_finite() || self.per_server_expected_mbps <= 0.0 {
            return Err(ControlError::InvalidConfig(format!(
                "per_server_expected_mbps must be positive, got {}",
                self.per_server_expected_mbps
            )));
        }
        if self.safety_violation_limit == 0 {
            return Err(ControlError::InvalidConfig(
                "safety_violation_limit must be at least 1".to_string(),
            ));
        }
        if self.bandwidth_target_mbps > 0.0 && self.download_url_pool.is_empty() {
            return Err(ControlError::InvalidConfig(
                "download_url_pool is empty but bandwidth_target_mbps is set".to_string(),
            ));
        }
        if let Some(url) = self
            .download_url_pool
            .iter()
            .find(|u| !matches!(u.scheme(), "http" | "https"))
        {
            return Err(ControlError::InvalidConfig(format!(
                "unsupported download URL scheme: {url}"
            )));
        }
        Ok(())
    }
}
