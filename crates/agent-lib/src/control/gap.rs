//! Gap calculation, hysteresis and the safety clamp
//!
//! The control law is a proportional step: when the gap clears the
//! hysteresis band the proposed total jumps straight to the target.

use serde::{Deserialize, Serialize};

/// Signed distance from the current total to the target
pub fn gap(target: f64, current_total: f64) -> f64 {
    target - current_total
}

/// Whether a gap is large enough to act on
pub fn should_adjust(gap: f64, min_adjustment_threshold: f64) -> bool {
    gap.abs() >= min_adjustment_threshold
}

/// Bounds proposed totals beneath a configured maximum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyClamp {
    pub max: f64,
}

impl SafetyClamp {
    pub fn new(max: f64) -> Self {
        Self { max }
    }

    /// Synthetic load allowed for `proposed_total` given `organic` load
    pub fn clamp(&self, proposed_total: f64, organic: f64) -> f64 {
        let bounded_total = if proposed_total > self.max {
            self.max
        } else {
            proposed_total
        };
        (bounded_total - organic).max(0.0)
    }

    /// True when a measured total is above the ceiling
    pub fn violated_by(&self, measured_total: f64) -> bool {
        measured_total > self.max
    }
}

/// Decision for one dimension in one control cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub gap: f64,
    /// New synthetic load to command; `None` inside the hysteresis band
    pub synthetic: Option<f64>,
}

impl Adjustment {
    /// Drop the change if it would raise synthetic load above `committed`
    pub fn hold_increase(self, committed: f64) -> Self {
        match self.synthetic {
            Some(synthetic) if synthetic > committed => Self {
                synthetic: None,
                ..self
            },
            _ => self,
        }
    }
}

/// Run gap → hysteresis → clamp for one dimension
pub fn plan_adjustment(
    target: f64,
    current_total: f64,
    organic: f64,
    clamp: SafetyClamp,
    min_adjustment_threshold: f64,
) -> Adjustment {
    let gap = gap(target, current_total);
    if !should_adjust(gap, min_adjustment_threshold) {
        return Adjustment {
            gap,
            synthetic: None,
        };
    }

    let proposed_total = current_total + gap;
    Adjustment {
        gap,
        synthetic: Some(clamp.clamp(proposed_total, organic)),
    }
}
