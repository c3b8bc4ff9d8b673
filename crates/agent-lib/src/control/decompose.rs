//! Organic/synthetic load decomposition
//!
//! Synthetic load is asserted from the last committed state, not measured:
//! per-process accounting is too noisy for system-wide percentages.

use crate::models::{RateSample, SyntheticLoadState};
use serde::{Deserialize, Serialize};

/// Load not generated by this system, never negative
pub fn organic(total: f64, synthetic: f64) -> f64 {
    (total - synthetic).max(0.0)
}

/// Split of one dimension's total into organic and synthetic parts
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSplit {
    pub total: f64,
    pub organic: f64,
    pub synthetic: f64,
}

impl LoadSplit {
    pub fn new(total: f64, synthetic: f64) -> Self {
        Self {
            total,
            organic: organic(total, synthetic),
            synthetic,
        }
    }
}

/// Decomposition of a full rate sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub cpu: LoadSplit,
    pub bw_rx: LoadSplit,
    pub bw_tx: LoadSplit,
    pub bw_total: LoadSplit,
}

/// Decompose every dimension of `sample` against the committed state
pub fn decompose(sample: &RateSample, state: &SyntheticLoadState) -> Decomposition {
    Decomposition {
        cpu: LoadSplit::new(sample.cpu_percent, state.cpu_percent),
        bw_rx: LoadSplit::new(sample.rx_mbps, state.bw_rx_mbps),
        bw_tx: LoadSplit::new(sample.tx_mbps, state.bw_tx_mbps),
        bw_total: LoadSplit::new(sample.total_mbps, state.bw_total_mbps),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SampleStatus;

    #[test]
    fn test_organic_never_negative() {
        let totals = [0.0, 0.5, 10.0, 30.0, 99.9, 100.0, 950.0];
        let synthetics = [0.0, 1.0, 20.0, 30.0, 60.0, 100.0, 1200.0];
        for t in totals {
            for s in synthetics {
                let o = organic(t, s);
                assert!(o >= 0.0);
                assert_eq!(o, (t - s).max(0.0));
            }
        }
    }

    #[test]
    fn test_decompose_per_direction() {
        let sample = RateSample {
            cpu_percent: 55.0,
            rx_mbps: 120.0,
            tx_mbps: 15.0,
            total_mbps: 135.0,
            status: SampleStatus::Measured,
            window_start: None,
        };
        let state = SyntheticLoadState {
            cpu_percent: 20.0,
            bw_total_mbps: 100.0,
            bw_rx_mbps: 100.0,
            ..Default::default()
        };

        let d = decompose(&sample, &state);
        assert_eq!(d.cpu.organic, 35.0);
        assert_eq!(d.bw_rx.organic, 20.0);
        assert_eq!(d.bw_tx.organic, 15.0);
        assert_eq!(d.bw_total.organic, 35.0);
        assert_eq!(d.bw_total.synthetic, 100.0);
    }

    #[test]
    fn test_decompose_synthetic_above_measured() {
        // Actuators ramping up: commanded load not yet visible
        let sample = RateSample {
            cpu_percent: 5.0,
            ..RateSample::zero(SampleStatus::Measured)
        };
        let state = SyntheticLoadState {
            cpu_percent: 40.0,
            ..Default::default()
        };
        assert_eq!(decompose(&sample, &state).cpu.organic, 0.0);
    }
}
