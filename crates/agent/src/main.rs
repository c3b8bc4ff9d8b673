//! loadpilot - closed-loop synthetic load controller
//!
//! Keeps CPU and network utilisation at a configured target by measuring
//! organic load and running external load generators to close the gap.

use anyhow::{Context, Result};
use clap::Parser;
use loadpilot_lib::{
    actuator::{ProcessActuator, ProcessActuatorConfig},
    api,
    control::{ControlCommand, Controller},
    health::HealthRegistry,
    observability::{AgentMetrics, StructuredLogger},
    report::ReportLoop,
    sampler::{create_source, SamplingLoopBuilder},
    LoadSettings, StateStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Editors emit several events per save
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "loadpilot", version, about = "Closed-loop synthetic load controller")]
struct Args {
    /// TOML configuration file, layered under LOADPILOT_* variables
    #[arg(short, long, env = "LOADPILOT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    info!(config = ?args.config, "Starting loadpilot");

    // Only configuration errors at startup are fatal
    let settings = Arc::new(config::load(args.config.as_deref()).context("failed to load configuration")?);
    let cores = settings.effective_cores();

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&settings.node_name);
    logger.log_startup(AGENT_VERSION, cores);

    let store = Arc::new(StateStore::new(&settings.state_path));
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let (settings_tx, settings_rx) = watch::channel(Arc::clone(&settings));

    // Sampling
    let source = create_source(&settings.proc_path, settings.network_interface.as_deref());
    let (sampling_loop, samples) = SamplingLoopBuilder::new()
        .source(Arc::clone(&source))
        .health(health_registry.clone())
        .settings(settings_rx.clone())
        .interval(settings.monitor_interval())
        .build()?;

    // Control
    let actuator = Arc::new(ProcessActuator::new(actuator_config(&settings)));
    let (controller, commands) =
        Controller::new(Arc::clone(&settings), actuator, Arc::clone(&store), samples);
    let controller = controller
        .with_health(health_registry.clone())
        .with_settings_publisher(settings_tx);

    // Reporting runs on its own sampler
    let report_loop = ReportLoop::new(source, Arc::clone(&store), settings_rx);

    let sampling_handle = tokio::spawn(sampling_loop.run(shutdown_tx.subscribe()));
    let controller_handle = tokio::spawn(controller.run(shutdown_tx.subscribe()));
    let report_handle = tokio::spawn(report_loop.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        Arc::clone(&store),
    ));
    let api_port = settings.api_port;
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            error!(error = %e, "API server failed");
        }
    });

    health_registry.set_ready(true).await;

    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    let _watcher = match args.config.as_deref() {
        Some(path) => match config::watch(path, reload_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Config file watching disabled");
                None
            }
        },
        None => None,
    };

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    let reason = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break "SIGINT received",
            _ = sigterm.recv() => break "SIGTERM received",
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload(args.config.as_deref(), &commands, &logger).await;
            }
            Some(()) = reload_rx.recv() => {
                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                while reload_rx.try_recv().is_ok() {}
                reload(args.config.as_deref(), &commands, &logger).await;
            }
        }
    };

    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;

    // Stop synthetic load before anything else goes away
    if commands.send(ControlCommand::Shutdown).await.is_err() {
        warn!("Controller already stopped");
    }
    if let Err(e) = controller_handle.await {
        error!(error = %e, "Control loop task failed");
    }

    let _ = shutdown_tx.send(());
    for handle in [sampling_handle, report_handle] {
        if let Err(e) = handle.await {
            error!(error = %e, "Loop task failed");
        }
    }
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

fn actuator_config(settings: &LoadSettings) -> ProcessActuatorConfig {
    ProcessActuatorConfig {
        cpu_tool: settings.cpu_tool.clone(),
        download_tool: settings.download_tool.clone(),
        stop_grace_period: settings.stop_grace_period(),
        ..Default::default()
    }
}

/// Load settings and hand them to the controller
///
/// A configuration that fails to load is logged and ignored. The controller
/// validates the rest and publishes what it applied to the other loops.
async fn reload(
    path: Option<&Path>,
    commands: &mpsc::Sender<ControlCommand>,
    logger: &StructuredLogger,
) {
    let settings = match config::load(path) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            logger.log_config_reloaded(false, &format!("{e:#}"));
            return;
        }
    };

    if commands.send(ControlCommand::Reload(settings)).await.is_err() {
        warn!("Controller stopped, reload not applied");
    }
}
