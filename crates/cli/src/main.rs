//! loadpilot operator CLI
//!
//! Inspects the shared state record and metrics export of a node running
//! the loadpilot agent, queries the agent's health endpoint, and previews
//! how a synthetic load would be translated into generator parameters.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{health, metrics, plan, status};
use loadpilot_lib::LoadSettings;
use std::path::PathBuf;

/// loadpilot operator CLI
#[derive(Parser)]
#[command(name = "lpctl")]
#[command(author, version, about = "CLI for the loadpilot synthetic load controller", long_about = None)]
pub struct Cli {
    /// Agent API URL
    #[arg(long, env = "LOADPILOT_AGENT_URL", default_value = "http://localhost:9464")]
    pub agent_url: String,

    /// Shared state record (defaults to the agent's default location)
    #[arg(long, env = "LOADPILOT_STATE_PATH")]
    pub state_path: Option<PathBuf>,

    /// Metrics export file (defaults to the agent's default location)
    #[arg(long, env = "LOADPILOT_METRICS_PATH")]
    pub metrics_path: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the committed synthetic load
    Status {
        /// Ask the running agent instead of reading the state file
        #[arg(long)]
        remote: bool,
    },

    /// Show the most recent metrics export records
    Metrics {
        /// Number of records to show
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
    },

    /// Preview generator parameters for a synthetic load
    Plan {
        /// Synthetic CPU load in percent of the whole machine
        #[arg(long, default_value_t = 0.0)]
        cpu: f64,

        /// Synthetic bandwidth in Mbps
        #[arg(long, default_value_t = 0.0)]
        bandwidth: f64,

        /// Core count (defaults to this machine's)
        #[arg(long)]
        cores: Option<u32>,

        /// Expected throughput of one unlimited downloader
        #[arg(long, default_value_t = 650.0)]
        per_server_mbps: f64,
    },

    /// Query the agent's health endpoint
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let defaults = LoadSettings::default();

    match cli.command {
        Commands::Status { remote } => {
            if remote {
                let client = client::AgentClient::new(&cli.agent_url)?;
                status::show_remote(&client, cli.format).await?;
            } else {
                let path = cli.state_path.unwrap_or(defaults.state_path);
                status::show_local(&path, cli.format)?;
            }
        }
        Commands::Metrics { limit } => {
            let path = cli.metrics_path.unwrap_or(defaults.metrics_path);
            metrics::show_metrics(&path, limit, cli.format)?;
        }
        Commands::Plan {
            cpu,
            bandwidth,
            cores,
            per_server_mbps,
        } => {
            let cores = cores.unwrap_or_else(|| defaults.effective_cores());
            let plan = plan::build_plan(cpu, bandwidth, cores, per_server_mbps)?;
            plan::show_plan(&plan, cli.format)?;
        }
        Commands::Health => {
            let client = client::AgentClient::new(&cli.agent_url)?;
            health::show_health(&client, cli.format).await?;
        }
    }

    Ok(())
}
