//! Core data models for the load controller

use crate::error::{ControlError, ControlResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Cumulative CPU time buckets from the aggregate `cpu` line of /proc/stat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTicks {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
}

impl CpuTicks {
    /// Sum of all seven buckets
    pub fn total(&self) -> u64 {
        self.user
            .saturating_add(self.nice)
            .saturating_add(self.system)
            .saturating_add(self.idle)
            .saturating_add(self.iowait)
            .saturating_add(self.irq)
            .saturating_add(self.softirq)
    }

    fn buckets(&self) -> [u64; 7] {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
        ]
    }

    /// True when any bucket went backwards relative to `earlier`
    pub fn regressed_from(&self, earlier: &CpuTicks) -> bool {
        self.buckets()
            .iter()
            .zip(earlier.buckets().iter())
            .any(|(now, before)| now < before)
    }
}

/// Cumulative network byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetBytes {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One read of the raw counters
///
/// A part is `None` when its source could not be read.
#[derive(Debug, Clone, Copy)]
pub struct CounterSnapshot {
    pub cpu: Option<CpuTicks>,
    pub net: Option<NetBytes>,
    pub taken_at: Instant,
}

/// How a [`RateSample`] was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    /// Computed from two consecutive snapshots
    Measured,
    /// First read after initialization; rates are zero by construction
    Baseline,
    /// `sample()` was called without `initialize()`; rates are zero
    Uninitialized,
    /// Counters were unreadable; values are the last known rates
    Stale,
}

/// Instantaneous utilisation derived from two counter snapshots
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    pub cpu_percent: f64,
    pub rx_mbps: f64,
    pub tx_mbps: f64,
    pub total_mbps: f64,
    pub status: SampleStatus,
    /// Earliest counter read the rates span; `None` unless `Measured`
    #[serde(skip)]
    pub window_start: Option<Instant>,
}

impl RateSample {
    /// Zero-valued sample tagged with the reason it is zero
    pub fn zero(status: SampleStatus) -> Self {
        Self {
            cpu_percent: 0.0,
            rx_mbps: 0.0,
            tx_mbps: 0.0,
            total_mbps: 0.0,
            status,
            window_start: None,
        }
    }

    /// True when every counter behind this sample was read at or after `at`
    pub fn measured_since(&self, at: Instant) -> bool {
        self.status == SampleStatus::Measured && self.window_start.is_some_and(|start| start >= at)
    }
}

impl Default for RateSample {
    fn default() -> Self {
        Self::zero(SampleStatus::Uninitialized)
    }
}

/// The synthetic load currently commanded by the controller
///
/// Serialized as a flat key/value record so that any process can read it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SyntheticLoadState {
    pub cpu_percent: f64,
    pub cpu_workers: u32,
    pub cpu_load_percent_per_worker: u8,
    pub bw_total_mbps: f64,
    pub bw_rx_mbps: f64,
    pub bw_tx_mbps: f64,
    pub bw_downloaders: u32,
    /// 0 means unlimited
    pub bw_rate_per_downloader_mbps: f64,
}

impl SyntheticLoadState {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    /// Replace the CPU half of the record with a committed command
    pub fn with_cpu(mut self, command: &CpuCommand, cores: u32) -> Self {
        self.cpu_workers = command.workers;
        self.cpu_load_percent_per_worker = command.load_percent;
        self.cpu_percent = command.system_percent(cores);
        self
    }

    /// Replace the bandwidth half of the record with a committed command
    ///
    /// `synthetic_mbps` is the rate the command was sized for. Downloads only
    /// generate receive traffic.
    pub fn with_bandwidth(mut self, command: &BandwidthCommand, synthetic_mbps: f64) -> Self {
        let total = if command.is_off() { 0.0 } else { synthetic_mbps.max(0.0) };
        self.bw_downloaders = command.downloaders;
        self.bw_rate_per_downloader_mbps = command.rate_mbps_per_downloader;
        self.bw_total_mbps = total;
        self.bw_rx_mbps = total;
        self.bw_tx_mbps = 0.0;
        self
    }
}

/// Target and ceilings for both controlled dimensions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlTarget {
    pub cpu_target_percent: f64,
    pub bandwidth_target_mbps: f64,
    pub max_cpu_percent: f64,
    pub max_bandwidth_mbps: f64,
    pub min_adjustment_threshold: f64,
}

impl ControlTarget {
    /// Check the ordering constraints between targets and maxima
    pub fn validate(&self) -> ControlResult<()> {
        let fields = [
            ("cpu_target_percent", self.cpu_target_percent),
            ("bandwidth_target_mbps", self.bandwidth_target_mbps),
            ("max_cpu_percent", self.max_cpu_percent),
            ("max_bandwidth_mbps", self.max_bandwidth_mbps),
            ("min_adjustment_threshold", self.min_adjustment_threshold),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(ControlError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.max_cpu_percent < self.cpu_target_percent {
            return Err(ControlError::InvalidConfig(format!(
                "max_cpu_percent ({}) is below cpu_target_percent ({})",
                self.max_cpu_percent, self.cpu_target_percent
            )));
        }
        if self.max_bandwidth_mbps < self.bandwidth_target_mbps {
            return Err(ControlError::InvalidConfig(format!(
                "max_bandwidth_mbps ({}) is below bandwidth_target_mbps ({})",
                self.max_bandwidth_mbps, self.bandwidth_target_mbps
            )));
        }
        Ok(())
    }
}

/// Parameters for the CPU load generator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuCommand {
    pub workers: u32,
    pub load_percent: u8,
}

impl CpuCommand {
    pub const OFF: CpuCommand = CpuCommand {
        workers: 0,
        load_percent: 0,
    };

    pub fn is_off(&self) -> bool {
        self.workers == 0
    }

    /// System-wide CPU percentage this command should produce on `cores` cores
    pub fn system_percent(&self, cores: u32) -> f64 {
        if self.is_off() || cores == 0 {
            return 0.0;
        }
        f64::from(self.workers) * f64::from(self.load_percent) / f64::from(cores)
    }
}

/// Bandwidth actuation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthMode {
    Off,
    RateLimited,
    Unlimited,
}

impl fmt::Display for BandwidthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandwidthMode::Off => write!(f, "off"),
            BandwidthMode::RateLimited => write!(f, "rate-limited"),
            BandwidthMode::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Parameters for the bandwidth load generators
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BandwidthCommand {
    pub downloaders: u32,
    /// 0 means unlimited
    pub rate_mbps_per_downloader: f64,
}

impl BandwidthCommand {
    pub const OFF: BandwidthCommand = BandwidthCommand {
        downloaders: 0,
        rate_mbps_per_downloader: 0.0,
    };

    pub fn is_off(&self) -> bool {
        self.downloaders == 0
    }

    pub fn mode(&self) -> BandwidthMode {
        if self.is_off() {
            BandwidthMode::Off
        } else if self.rate_mbps_per_downloader > 0.0 {
            BandwidthMode::RateLimited
        } else {
            BandwidthMode::Unlimited
        }
    }
}

/// A controlled resource dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Cpu,
    Bandwidth,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Bandwidth => "bandwidth",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the metrics export
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub timestamp: i64,
    pub cpu_target: f64,
    pub cpu_organic: f64,
    pub cpu_synthetic: f64,
    pub cpu_total: f64,
    pub bw_target: f64,
    pub bw_organic: f64,
    pub bw_synthetic: f64,
    pub bw_total: f64,
}
