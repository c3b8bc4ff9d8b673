//! Sampling loop
//!
//! Runs the sampler on its own fast cycle and publishes the latest
//! [`RateSample`] on a watch channel for the control loop.

use super::{CounterSource, Sampler};
use crate::health::{components, HealthRegistry};
use crate::models::{RateSample, SampleStatus};
use crate::observability::AgentMetrics;
use crate::settings::LoadSettings;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Configuration for the sampling loop
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Sampling interval (default: 1 second)
    pub interval: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

/// Periodically samples utilisation and publishes it
pub struct SamplingLoop {
    sampler: Sampler,
    config: SamplingConfig,
    sample_tx: watch::Sender<RateSample>,
    health: Option<HealthRegistry>,
    /// Applied settings; the interval follows `monitor_interval_s`
    settings: Option<watch::Receiver<Arc<LoadSettings>>>,
    metrics: AgentMetrics,
}

impl SamplingLoop {
    /// Create a new sampling loop and the receiver for its samples
    pub fn new(
        source: Arc<dyn CounterSource>,
        config: SamplingConfig,
    ) -> (Self, watch::Receiver<RateSample>) {
        let (sample_tx, sample_rx) = watch::channel(RateSample::default());

        let loop_instance = Self {
            sampler: Sampler::new(source),
            config,
            sample_tx,
            health: None,
            settings: None,
            metrics: AgentMetrics::new(),
        };

        (loop_instance, sample_rx)
    }

    /// Report sampler health into the given registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_settings(mut self, settings: watch::Receiver<Arc<LoadSettings>>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Run until a shutdown signal arrives
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting sampling loop"
        );

        self.sampler.initialize();

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sample_count = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = self.sample_once().await;
                    sample_count += 1;

                    if sample_count % 60 == 0 {
                        debug!(
                            cpu_percent = sample.cpu_percent,
                            total_mbps = sample.total_mbps,
                            status = ?sample.status,
                            "Sampling cycle complete"
                        );
                    }
                }
                Some(period) = interval_changed(&mut self.settings) => {
                    if period != self.config.interval {
                        info!(interval_ms = period.as_millis() as u64, "Sampling interval changed");
                        self.config.interval = period;
                        ticker = interval(period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down sampling loop");
                    break;
                }
            }
        }
    }

    /// Take one sample, publish it and update health
    async fn sample_once(&mut self) -> RateSample {
        let sample = self.sampler.sample().await;

        if let Some(health) = &self.health {
            match sample.status {
                SampleStatus::Stale => {
                    self.metrics.inc_sample_errors();
                    health
                        .set_degraded(components::SAMPLER, "counters unavailable, using last known rates")
                        .await;
                }
                _ => health.set_healthy(components::SAMPLER).await,
            }
        } else if sample.status == SampleStatus::Stale {
            self.metrics.inc_sample_errors();
        }

        self.sample_tx.send_replace(sample);
        sample
    }
}

/// Resolves with the new interval once settings are republished
async fn interval_changed(
    settings: &mut Option<watch::Receiver<Arc<LoadSettings>>>,
) -> Option<Duration> {
    let rx = settings.as_mut()?;
    rx.changed().await.ok()?;
    let period = rx.borrow_and_update().monitor_interval();
    Some(period)
}

/// Builder for the sampling loop
pub struct SamplingLoopBuilder {
    source: Option<Arc<dyn CounterSource>>,
    health: Option<HealthRegistry>,
    settings: Option<watch::Receiver<Arc<LoadSettings>>>,
    config: SamplingConfig,
}

impl SamplingLoopBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            health: None,
            settings: None,
            config: SamplingConfig::default(),
        }
    }

    /// Set the counter source
    pub fn source(mut self, source: Arc<dyn CounterSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the health registry
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Follow `monitor_interval_s` of published settings
    pub fn settings(mut self, settings: watch::Receiver<Arc<LoadSettings>>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Set the sampling interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Build the sampling loop
    pub fn build(self) -> Result<(SamplingLoop, watch::Receiver<RateSample>)> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Counter source is required"))?;

        let (mut sampling_loop, rx) = SamplingLoop::new(source, self.config);
        if let Some(health) = self.health {
            sampling_loop = sampling_loop.with_health(health);
        }
        if let Some(settings) = self.settings {
            sampling_loop = sampling_loop.with_settings(settings);
        }
        Ok((sampling_loop, rx))
    }
}

impl Default for SamplingLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
