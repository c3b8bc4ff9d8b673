//! Shared state inspection

use anyhow::{Context, Result};
use colored::Colorize;
use loadpilot_lib::state::read_snapshot;
use loadpilot_lib::StateSnapshot;
use std::path::Path;
use tabled::Tabled;

use crate::client::AgentClient;
use crate::output::{
    format_mbps, format_percent, format_rate_limit, format_timestamp, print_info, print_json,
    print_rows, OutputFormat,
};

#[derive(Tabled)]
struct FieldRow {
    #[tabled(rename = "Dimension")]
    dimension: &'static str,
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

/// Show the state record read straight from disk
pub fn show_local(state_path: &Path, format: OutputFormat) -> Result<()> {
    let snapshot = read_snapshot(state_path)
        .with_context(|| format!("Failed to read state record {}", state_path.display()))?;
    render(&snapshot, &state_path.display().to_string(), format)
}

/// Show the state record as served by a running agent
pub async fn show_remote(client: &AgentClient, format: OutputFormat) -> Result<()> {
    let snapshot = client.state().await?;
    render(&snapshot, "agent /state", format)
}

fn render(snapshot: &StateSnapshot, source: &str, format: OutputFormat) -> Result<()> {
    if let OutputFormat::Json = format {
        return print_json(snapshot);
    }

    println!("{}", "Synthetic Load State".bold());
    println!("{}", "=".repeat(60));
    println!("Source:  {}", source.cyan());
    println!("Version: {}", snapshot.version);
    println!("Updated: {}", format_timestamp(snapshot.updated_at));
    println!();

    if snapshot.state.is_idle() {
        print_info("No synthetic load commanded");
        return Ok(());
    }

    print_rows(rows(snapshot), "No synthetic load commanded");
    Ok(())
}

fn rows(snapshot: &StateSnapshot) -> Vec<FieldRow> {
    let s = &snapshot.state;
    vec![
        FieldRow {
            dimension: "cpu",
            field: "synthetic",
            value: format_percent(s.cpu_percent),
        },
        FieldRow {
            dimension: "cpu",
            field: "workers",
            value: format!("{} x {}%", s.cpu_workers, s.cpu_load_percent_per_worker),
        },
        FieldRow {
            dimension: "bandwidth",
            field: "synthetic",
            value: format_mbps(s.bw_total_mbps),
        },
        FieldRow {
            dimension: "bandwidth",
            field: "rx / tx",
            value: format!("{} / {}", format_mbps(s.bw_rx_mbps), format_mbps(s.bw_tx_mbps)),
        },
        FieldRow {
            dimension: "bandwidth",
            field: "downloaders",
            value: format!(
                "{} @ {}",
                s.bw_downloaders,
                format_rate_limit(s.bw_rate_per_downloader_mbps)
            ),
        },
    ]
}
