//! Observability infrastructure for loadpilot
//!
//! Provides:
//! - Prometheus metrics (load decomposition gauges, actuation and safety counters, cycle latency)
//! - Structured JSON logging with tracing

use crate::control::decompose::LoadSplit;
use crate::models::{BandwidthCommand, CpuCommand, Dimension};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for control cycle latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    load: GaugeVec,
    control_cycle_seconds: Histogram,
    actuations: IntCounterVec,
    actuator_phase: IntGaugeVec,
    safety_violations: IntCounterVec,
    emergency_shutdowns: IntCounter,
    sample_errors: IntCounter,
    state_store_errors: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            load: register_gauge_vec!(
                "loadpilot_load",
                "Target and decomposed load per dimension (percent for cpu, Mbps for bandwidth)",
                &["dimension", "kind"]
            )
            .expect("Failed to register load"),

            control_cycle_seconds: register_histogram!(
                "loadpilot_control_cycle_seconds",
                "Time spent in one control cycle, including actuation",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register control_cycle_seconds"),

            actuations: register_int_counter_vec!(
                "loadpilot_actuations_total",
                "Actuator commands issued",
                &["dimension"]
            )
            .expect("Failed to register actuations"),

            actuator_phase: register_int_gauge_vec!(
                "loadpilot_actuator_phase",
                "Current actuator phase per dimension (1 for the active phase)",
                &["dimension", "phase"]
            )
            .expect("Failed to register actuator_phase"),

            safety_violations: register_int_counter_vec!(
                "loadpilot_safety_violations_total",
                "Cycles where measured load exceeded the configured maximum",
                &["dimension"]
            )
            .expect("Failed to register safety_violations"),

            emergency_shutdowns: register_int_counter!(
                "loadpilot_emergency_shutdowns_total",
                "Emergency shutdowns triggered by repeated safety violations"
            )
            .expect("Failed to register emergency_shutdowns"),

            sample_errors: register_int_counter!(
                "loadpilot_sample_errors_total",
                "Sampling cycles that fell back to stale rates"
            )
            .expect("Failed to register sample_errors"),

            state_store_errors: register_int_counter!(
                "loadpilot_state_store_errors_total",
                "Failed reads or writes of the shared state record"
            )
            .expect("Failed to register state_store_errors"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    /// Publish target and decomposition for one dimension
    pub fn set_load(&self, dimension: Dimension, target: f64, split: &LoadSplit) {
        let dim = dimension.as_str();
        let load = &self.inner().load;
        load.with_label_values(&[dim, "target"]).set(target);
        load.with_label_values(&[dim, "organic"]).set(split.organic);
        load.with_label_values(&[dim, "synthetic"]).set(split.synthetic);
        load.with_label_values(&[dim, "total"]).set(split.total);
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().control_cycle_seconds.observe(duration_secs);
    }

    pub fn inc_actuations(&self, dimension: Dimension) {
        self.inner()
            .actuations
            .with_label_values(&[dimension.as_str()])
            .inc();
    }

    /// Mark `phase` as the only active phase of `dimension`
    pub fn set_actuator_phase(&self, dimension: Dimension, phase: &str) {
        let gauge = &self.inner().actuator_phase;
        for candidate in ["idle", "actuating", "steady", "degraded", "recovering"] {
            let value = i64::from(candidate == phase);
            gauge
                .with_label_values(&[dimension.as_str(), candidate])
                .set(value);
        }
    }

    pub fn inc_safety_violations(&self, dimension: Dimension) {
        self.inner()
            .safety_violations
            .with_label_values(&[dimension.as_str()])
            .inc();
    }

    pub fn inc_emergency_shutdowns(&self) {
        self.inner().emergency_shutdowns.inc();
    }

    pub fn inc_sample_errors(&self) {
        self.inner().sample_errors.inc();
    }

    pub fn inc_state_store_errors(&self) {
        self.inner().state_store_errors.inc();
    }
}

/// Structured logger for agent events
///
/// Every record carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, cores: u32) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            cores = cores,
            "loadpilot started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "loadpilot shutting down"
        );
    }

    pub fn log_cpu_actuation(&self, command: &CpuCommand, synthetic_percent: f64) {
        info!(
            event = "actuation",
            node = %self.node_name,
            dimension = "cpu",
            workers = command.workers,
            load_percent = command.load_percent,
            synthetic_percent = synthetic_percent,
            "CPU actuation"
        );
    }

    pub fn log_bandwidth_actuation(&self, command: &BandwidthCommand, synthetic_mbps: f64) {
        info!(
            event = "actuation",
            node = %self.node_name,
            dimension = "bandwidth",
            downloaders = command.downloaders,
            rate_mbps_per_downloader = command.rate_mbps_per_downloader,
            mode = %command.mode(),
            synthetic_mbps = synthetic_mbps,
            "Bandwidth actuation"
        );
    }

    pub fn log_safety_violation(
        &self,
        dimension: Dimension,
        measured: f64,
        max: f64,
        consecutive: u32,
        limit: u32,
    ) {
        warn!(
            event = "safety_violation",
            node = %self.node_name,
            dimension = %dimension,
            measured = measured,
            max = max,
            consecutive = consecutive,
            limit = limit,
            "Measured load above configured maximum"
        );
    }

    pub fn log_emergency_shutdown(&self, reason: &str) {
        error!(
            event = "emergency_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Emergency shutdown: all synthetic load killed, controller halted until reload"
        );
    }

    pub fn log_config_reloaded(&self, applied: bool, detail: &str) {
        if applied {
            info!(
                event = "config_reloaded",
                node = %self.node_name,
                applied = true,
                detail = %detail,
                "Configuration reloaded"
            );
        } else {
            warn!(
                event = "config_reloaded",
                node = %self.node_name,
                applied = false,
                detail = %detail,
                "Configuration reload rejected, keeping previous settings"
            );
        }
    }

    pub fn log_actuator_died(&self, dimension: Dimension, pid: Option<u32>) {
        warn!(
            event = "actuator_died",
            node = %self.node_name,
            dimension = %dimension,
            pid = ?pid,
            "Actuator exited unexpectedly"
        );
    }
}
