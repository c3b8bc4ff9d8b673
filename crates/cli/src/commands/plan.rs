//! Dry-run of the parameter translation

use anyhow::{bail, Result};
use colored::Colorize;
use loadpilot_lib::control::ParameterTranslator;
use loadpilot_lib::{BandwidthCommand, BandwidthMode, CpuCommand};
use serde::Serialize;

use crate::output::{format_mbps, format_percent, format_rate_limit, print_json, OutputFormat};

/// Commands the controller would issue for the given synthetic load
#[derive(Debug, Serialize)]
pub struct Plan {
    pub cores: u32,
    pub cpu_synthetic_percent: f64,
    pub cpu: CpuCommand,
    pub bandwidth_synthetic_mbps: f64,
    pub bandwidth: BandwidthCommand,
    pub bandwidth_mode: BandwidthMode,
}

pub fn build_plan(cpu: f64, bandwidth: f64, cores: u32, per_server_mbps: f64) -> Result<Plan> {
    if cores == 0 {
        bail!("--cores must be at least 1");
    }
    let translator = ParameterTranslator::new(cores, per_server_mbps);
    let bw = translator.bandwidth(bandwidth);
    Ok(Plan {
        cores,
        cpu_synthetic_percent: cpu,
        cpu: translator.cpu(cpu),
        bandwidth_synthetic_mbps: bandwidth,
        bandwidth: bw,
        bandwidth_mode: bw.mode(),
    })
}

pub fn show_plan(plan: &Plan, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        return print_json(plan);
    }

    println!("{}", "Actuation Plan".bold());
    println!("{}", "=".repeat(60));
    println!(
        "CPU:       {} on {} cores -> {}",
        format_percent(plan.cpu_synthetic_percent),
        plan.cores,
        if plan.cpu.is_off() {
            "off".dimmed().to_string()
        } else {
            format!("{} workers x {}%", plan.cpu.workers, plan.cpu.load_percent)
                .cyan()
                .to_string()
        }
    );
    println!(
        "Bandwidth: {} -> {}",
        format_mbps(plan.bandwidth_synthetic_mbps),
        if plan.bandwidth.is_off() {
            "off".dimmed().to_string()
        } else {
            format!(
                "{} downloaders @ {} ({})",
                plan.bandwidth.downloaders,
                format_rate_limit(plan.bandwidth.rate_mbps_per_downloader),
                plan.bandwidth_mode
            )
            .cyan()
            .to_string()
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_plan() {
        let plan = build_plan(20.0, 1000.0, 4, 650.0).unwrap();
        assert_eq!(
            plan.cpu,
            CpuCommand {
                workers: 4,
                load_percent: 20
            }
        );
        assert_eq!(plan.bandwidth.downloaders, 2);
        assert_eq!(plan.bandwidth_mode, BandwidthMode::Unlimited);
    }

    #[test]
    fn test_build_plan_rejects_zero_cores() {
        assert!(build_plan(20.0, 0.0, 0, 650.0).is_err());
    }
}
