//! Rate computation from successive counter snapshots

use super::CounterSource;
use crate::models::{CounterSnapshot, CpuTicks, NetBytes, RateSample, SampleStatus};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of one metric within a sampling pass
enum Reading<T> {
    Rate(T),
    Baseline,
    Unavailable,
}

/// Converts cumulative counters into instantaneous rates
///
/// Every execution context that samples must own its own `Sampler` and call
/// [`Sampler::initialize`] before use; baselines are never shared.
pub struct Sampler {
    source: Arc<dyn CounterSource>,
    initialized: bool,
    cpu_baseline: Option<(CpuTicks, Instant)>,
    net_baseline: Option<(NetBytes, Instant)>,
    last_cpu_percent: f64,
    last_net_mbps: (f64, f64),
}

impl Sampler {
    pub fn new(source: Arc<dyn CounterSource>) -> Self {
        Self {
            source,
            initialized: false,
            cpu_baseline: None,
            net_baseline: None,
            last_cpu_percent: 0.0,
            last_net_mbps: (0.0, 0.0),
        }
    }

    /// Reset baselines; the next `sample()` records a fresh baseline
    pub fn initialize(&mut self) {
        self.initialized = true;
        self.cpu_baseline = None;
        self.net_baseline = None;
        self.last_cpu_percent = 0.0;
        self.last_net_mbps = (0.0, 0.0);
        debug!("Sampler initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Read both counter sources once
    ///
    /// `taken_at` is stamped before either source is read.
    pub async fn snapshot(&self) -> CounterSnapshot {
        let taken_at = Instant::now();
        let cpu = match self.source.read_cpu().await {
            Ok(ticks) => Some(ticks),
            Err(e) => {
                warn!(error = %e, "CPU counters unavailable");
                None
            }
        };
        let net = match self.source.read_net().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "Network counters unavailable");
                None
            }
        };

        CounterSnapshot { cpu, net, taken_at }
    }

    /// Produce the current rate sample
    ///
    /// Returns zero with status `Uninitialized` when `initialize()` was never
    /// called, without recording a baseline.
    pub async fn sample(&mut self) -> RateSample {
        if !self.initialized {
            warn!("sample() called on an uninitialized sampler, reporting zero");
            return RateSample::zero(SampleStatus::Uninitialized);
        }

        let snapshot = self.snapshot().await;
        let window_start = match (&self.cpu_baseline, &self.net_baseline) {
            (Some((_, cpu_at)), Some((_, net_at))) => Some((*cpu_at).min(*net_at)),
            _ => None,
        };
        let cpu = self.cpu_reading(snapshot.cpu, snapshot.taken_at);
        let net = self.net_reading(snapshot.net, snapshot.taken_at);

        let mut status = SampleStatus::Measured;
        let mut degrade = |s: SampleStatus| {
            status = match (status, s) {
                (SampleStatus::Stale, _) | (_, SampleStatus::Stale) => SampleStatus::Stale,
                _ => s,
            };
        };

        let cpu_percent = match cpu {
            Reading::Rate(pct) => {
                self.last_cpu_percent = pct;
                pct
            }
            Reading::Baseline => {
                degrade(SampleStatus::Baseline);
                0.0
            }
            Reading::Unavailable => {
                degrade(SampleStatus::Stale);
                self.last_cpu_percent
            }
        };

        let (rx_mbps, tx_mbps) = match net {
            Reading::Rate(rates) => {
                self.last_net_mbps = rates;
                rates
            }
            Reading::Baseline => {
                degrade(SampleStatus::Baseline);
                (0.0, 0.0)
            }
            Reading::Unavailable => {
                degrade(SampleStatus::Stale);
                self.last_net_mbps
            }
        };

        RateSample {
            cpu_percent,
            rx_mbps,
            tx_mbps,
            total_mbps: rx_mbps + tx_mbps,
            window_start: (status == SampleStatus::Measured)
                .then_some(window_start)
                .flatten(),
            status,
        }
    }

    fn cpu_reading(&mut self, current: Option<CpuTicks>, at: Instant) -> Reading<f64> {
        let Some(current) = current else {
            return Reading::Unavailable;
        };

        let Some((previous, _)) = self.cpu_baseline.replace((current, at)) else {
            return Reading::Baseline;
        };

        if current.regressed_from(&previous) {
            warn!("CPU counters went backwards, re-baselining");
            return Reading::Baseline;
        }

        Reading::Rate(cpu_percent(&previous, &current))
    }

    fn net_reading(&mut self, current: Option<NetBytes>, at: Instant) -> Reading<(f64, f64)> {
        let Some(current) = current else {
            return Reading::Unavailable;
        };

        let Some((previous, previous_at)) = self.net_baseline.replace((current, at)) else {
            return Reading::Baseline;
        };

        if current.rx_bytes < previous.rx_bytes || current.tx_bytes < previous.tx_bytes {
            warn!(
                previous_rx = previous.rx_bytes,
                current_rx = current.rx_bytes,
                previous_tx = previous.tx_bytes,
                current_tx = current.tx_bytes,
                "Network counters went backwards (interface reset?), re-baselining"
            );
            return Reading::Baseline;
        }

        let seconds = at.saturating_duration_since(previous_at).as_secs_f64();
        Reading::Rate((
            mbps(current.rx_bytes - previous.rx_bytes, seconds),
            mbps(current.tx_bytes - previous.tx_bytes, seconds),
        ))
    }
}

/// Busy share of CPU time between two tick readings, in percent
pub fn cpu_percent(previous: &CpuTicks, current: &CpuTicks) -> f64 {
    let total = current.total().saturating_sub(previous.total());
    if total == 0 {
        return 0.0;
    }
    let idle = current.idle.saturating_sub(previous.idle).min(total);
    let busy = (total - idle) as f64;
    (100.0 * busy / total as f64).clamp(0.0, 100.0)
}

/// Megabits per second for a byte delta over `seconds`
pub fn mbps(bytes: u64, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / seconds / 1_000_000.0
}
