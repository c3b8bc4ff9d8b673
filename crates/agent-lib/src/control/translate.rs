//! Translation of synthetic load targets into actuator parameters
//!
//! CPU load is spread over one worker per core so the per-worker load
//! equals the system-wide percentage. Bandwidth switches between
//! rate-limited downloads (precise, below the per-server throughput
//! ceiling) and unlimited downloads sized by expected server throughput.

use crate::models::{BandwidthCommand, CpuCommand};

/// Synthetic rate at which bandwidth actuation stops rate-limiting
pub const UNLIMITED_MODE_THRESHOLD_MBPS: f64 = 600.0;

/// Default sustained throughput of one download server
pub const DEFAULT_PER_SERVER_EXPECTED_MBPS: f64 = 650.0;

/// Upper bound on parallel unlimited downloaders
pub const MAX_UNLIMITED_DOWNLOADERS: u32 = 6;

/// CPU command for `synthetic_percent` of system-wide CPU on `cores` cores
pub fn translate_cpu(synthetic_percent: f64, cores: u32) -> CpuCommand {
    if cores == 0 || synthetic_percent.is_nan() || synthetic_percent <= 0.0 {
        return CpuCommand::OFF;
    }

    let load_percent = synthetic_percent.round().min(100.0) as u8;
    if load_percent == 0 {
        return CpuCommand::OFF;
    }

    CpuCommand {
        workers: cores,
        load_percent,
    }
}

/// Downloader count for rate-limited mode
pub fn rate_limited_downloaders(synthetic_mbps: f64) -> u32 {
    if synthetic_mbps < 50.0 {
        1
    } else if synthetic_mbps < 100.0 {
        2
    } else if synthetic_mbps < 200.0 {
        3
    } else {
        4
    }
}

/// Bandwidth command for `synthetic_mbps` of download traffic
pub fn translate_bandwidth(synthetic_mbps: f64, per_server_expected_mbps: f64) -> BandwidthCommand {
    if synthetic_mbps.is_nan() || synthetic_mbps <= 0.0 {
        return BandwidthCommand::OFF;
    }

    if synthetic_mbps < UNLIMITED_MODE_THRESHOLD_MBPS {
        let downloaders = rate_limited_downloaders(synthetic_mbps);
        return BandwidthCommand {
            downloaders,
            rate_mbps_per_downloader: synthetic_mbps / f64::from(downloaders),
        };
    }

    let per_server = if per_server_expected_mbps > 0.0 {
        per_server_expected_mbps
    } else {
        DEFAULT_PER_SERVER_EXPECTED_MBPS
    };
    let wanted = (synthetic_mbps / per_server).ceil();
    let downloaders = (wanted as u32).clamp(1, MAX_UNLIMITED_DOWNLOADERS);

    BandwidthCommand {
        downloaders,
        rate_mbps_per_downloader: 0.0,
    }
}

/// Translator bound to a host's core count and server throughput estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterTranslator {
    pub cores: u32,
    pub per_server_expected_mbps: f64,
}

impl ParameterTranslator {
    pub fn new(cores: u32, per_server_expected_mbps: f64) -> Self {
        Self {
            cores,
            per_server_expected_mbps,
        }
    }

    pub fn cpu(&self, synthetic_percent: f64) -> CpuCommand {
        translate_cpu(synthetic_percent, self.cores)
    }

    pub fn bandwidth(&self, synthetic_mbps: f64) -> BandwidthCommand {
        translate_bandwidth(synthetic_mbps, self.per_server_expected_mbps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BandwidthMode;

    fn translator() -> ParameterTranslator {
        ParameterTranslator::new(4, DEFAULT_PER_SERVER_EXPECTED_MBPS)
    }

    #[test]
    fn test_cpu_zero_target() {
        assert_eq!(translator().cpu(0.0), CpuCommand::OFF);
        assert_eq!(translator().cpu(-3.0), CpuCommand::OFF);
        assert_eq!(translator().cpu(0.4), CpuCommand::OFF);
    }

    #[test]
    fn test_cpu_over_range_capped() {
        let cmd = translator().cpu(150.0);
        assert_eq!(cmd.workers, 4);
        assert_eq!(cmd.load_percent, 100);
    }

    #[test]
    fn test_cpu_one_worker_per_core() {
        let cmd = translator().cpu(20.0);
        assert_eq!(
            cmd,
            CpuCommand {
                workers: 4,
                load_percent: 20
            }
        );
        assert!((cmd.system_percent(4) - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cpu_rounds() {
        assert_eq!(translator().cpu(33.6).load_percent, 34);
        assert_eq!(translator().cpu(33.4).load_percent, 33);
    }

    #[test]
    fn test_bandwidth_zero_target() {
        assert_eq!(translator().bandwidth(0.0), BandwidthCommand::OFF);
        assert_eq!(translator().bandwidth(-10.0), BandwidthCommand::OFF);
    }

    #[test]
    fn test_bandwidth_mode_boundary() {
        let below = translator().bandwidth(599.9);
        assert_eq!(below.mode(), BandwidthMode::RateLimited);
        assert!(below.rate_mbps_per_downloader > 0.0);
        assert_eq!(below.downloaders, 4);

        let at = translator().bandwidth(600.0);
        assert_eq!(at.mode(), BandwidthMode::Unlimited);
        assert_eq!(at.rate_mbps_per_downloader, 0.0);
        assert_eq!(at.downloaders, 1);
    }

    #[test]
    fn test_bandwidth_rate_limited_steps() {
        let cases = [
            (10.0, 1),
            (49.9, 1),
            (50.0, 2),
            (99.9, 2),
            (100.0, 3),
            (199.9, 3),
            (200.0, 4),
            (500.0, 4),
        ];
        for (target, expected) in cases {
            let cmd = translator().bandwidth(target);
            assert_eq!(cmd.downloaders, expected, "target {target}");
            let delivered = cmd.rate_mbps_per_downloader * f64::from(cmd.downloaders);
            assert!((delivered - target).abs() < 1e-9);
        }
    }

    #[test]
    fn test_bandwidth_unlimited_sizing() {
        let cmd = translator().bandwidth(1000.0);
        assert_eq!(cmd.downloaders, 2);
        assert_eq!(cmd.rate_mbps_per_downloader, 0.0);

        assert_eq!(translator().bandwidth(1300.0).downloaders, 2);
        assert_eq!(translator().bandwidth(1301.0).downloaders, 3);
        // Capped at six downloaders
        assert_eq!(translator().bandwidth(100_000.0).downloaders, 6);
    }

    #[test]
    fn test_bandwidth_downloaders_monotonic_within_mode() {
        let mut previous = 0;
        let mut target = 0.5;
        while target < UNLIMITED_MODE_THRESHOLD_MBPS {
            let n = translator().bandwidth(target).downloaders;
            assert!(n >= previous);
            previous = n;
            target += 0.5;
        }

        let mut previous = 0;
        let mut target = UNLIMITED_MODE_THRESHOLD_MBPS;
        while target < 10_000.0 {
            let n = translator().bandwidth(target).downloaders;
            assert!(n >= previous);
            previous = n;
            target += 7.5;
        }
    }

    #[test]
    fn test_bandwidth_invalid_per_server_falls_back() {
        let cmd = translate_bandwidth(1000.0, 0.0);
        assert_eq!(cmd.downloaders, 2);
    }
}
