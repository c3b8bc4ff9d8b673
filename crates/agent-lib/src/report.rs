//! Reporting loop
//!
//! Runs independently of the controller: it owns its own sampler, reads
//! the committed synthetic state from the store and appends one
//! [`MetricsRecord`] per cycle to a JSON-lines export.

use crate::control::decompose::{decompose, Decomposition};
use crate::error::{ControlError, ControlResult};
use crate::models::{Dimension, MetricsRecord, SampleStatus, SyntheticLoadState};
use crate::observability::AgentMetrics;
use crate::sampler::{CounterSource, Sampler};
use crate::settings::LoadSettings;
use crate::state::StateStore;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Build the export row for one decomposition
pub fn build_record(
    timestamp: i64,
    settings: &LoadSettings,
    decomposition: &Decomposition,
) -> MetricsRecord {
    MetricsRecord {
        timestamp,
        cpu_target: settings.cpu_target_percent,
        cpu_organic: decomposition.cpu.organic,
        cpu_synthetic: decomposition.cpu.synthetic,
        cpu_total: decomposition.cpu.total,
        bw_target: settings.bandwidth_target_mbps,
        bw_organic: decomposition.bw_total.organic,
        bw_synthetic: decomposition.bw_total.synthetic,
        bw_total: decomposition.bw_total.total,
    }
}

/// Append one record as a JSON line
pub fn append_record(path: &Path, record: &MetricsRecord) -> ControlResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ControlError::StateStore(format!(
                    "failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }

    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(&line))
        .map_err(|e| {
            ControlError::StateStore(format!("failed to append to {}: {e}", path.display()))
        })
}

/// Periodic metrics export
pub struct ReportLoop {
    sampler: Sampler,
    store: Arc<StateStore>,
    settings: watch::Receiver<Arc<LoadSettings>>,
    metrics_path: PathBuf,
    metrics: AgentMetrics,
}

impl ReportLoop {
    pub fn new(
        source: Arc<dyn CounterSource>,
        store: Arc<StateStore>,
        settings: watch::Receiver<Arc<LoadSettings>>,
    ) -> Self {
        let metrics_path = settings.borrow().metrics_path.clone();
        Self {
            sampler: Sampler::new(source),
            store,
            settings,
            metrics_path,
            metrics: AgentMetrics::new(),
        }
    }

    /// Run until a shutdown signal arrives
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.settings.borrow().report_interval();
        info!(
            interval_ms = period.as_millis() as u64,
            path = %self.metrics_path.display(),
            "Starting reporting loop"
        );

        // This loop owns its sampler, so it establishes its own baseline
        self.sampler.initialize();

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.report_once().await {
                        warn!(error = %e, "Reporting cycle failed");
                    }
                }
                Ok(()) = self.settings.changed() => {
                    let (period, path) = {
                        let settings = self.settings.borrow_and_update();
                        (settings.report_interval(), settings.metrics_path.clone())
                    };
                    self.metrics_path = path;
                    ticker = interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
                _ = shutdown.recv() => {
                    info!("Shutting down reporting loop");
                    break;
                }
            }
        }
    }

    /// Sample, decompose and export one record
    ///
    /// Returns `None` while the sampler is still establishing its baseline.
    pub async fn report_once(&mut self) -> ControlResult<Option<MetricsRecord>> {
        let sample = self.sampler.sample().await;
        if matches!(
            sample.status,
            SampleStatus::Baseline | SampleStatus::Uninitialized
        ) {
            debug!(status = ?sample.status, "Skipping report without a measured sample");
            return Ok(None);
        }

        let state = match self.store.load() {
            Ok(snapshot) => snapshot.state,
            Err(e) => {
                warn!(error = %e, "Failed to read shared state, reporting zero synthetic load");
                self.metrics.inc_state_store_errors();
                SyntheticLoadState::default()
            }
        };

        let decomposition = decompose(&sample, &state);
        let settings = Arc::clone(&self.settings.borrow());
        let record = build_record(chrono::Utc::now().timestamp(), &settings, &decomposition);

        self.metrics
            .set_load(Dimension::Cpu, record.cpu_target, &decomposition.cpu);
        self.metrics
            .set_load(Dimension::Bandwidth, record.bw_target, &decomposition.bw_total);

        append_record(&self.metrics_path, &record)?;
        Ok(Some(record))
    }
}
