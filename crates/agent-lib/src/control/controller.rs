//! Control loop
//!
//! Each cycle reads the latest [`RateSample`], decomposes it against the
//! committed synthetic state, checks the safety ceilings, plans one
//! adjustment per dimension and actuates when the translated command
//! changed. The committed state is persisted after every successful start
//! or stop so other processes decompose against what is actually running.

use super::decompose::{decompose, Decomposition};
use super::gap::{plan_adjustment, Adjustment, SafetyClamp};
use super::phase::{ActuatorPhase, PhaseEvent};
use super::translate::ParameterTranslator;
use crate::actuator::{Actuator, ActuatorHandle};
use crate::error::{ControlError, ControlResult};
use crate::health::{components, HealthRegistry};
use crate::models::{
    BandwidthCommand, ControlTarget, CpuCommand, Dimension, RateSample, SampleStatus,
    SyntheticLoadState,
};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::settings::LoadSettings;
use crate::state::StateStore;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Requests delivered to a running controller
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Stop actuators, commit zero state and adopt new settings
    Reload(Arc<LoadSettings>),
    /// Graceful stop, then exit the loop
    Shutdown,
}

/// Result of one control cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    /// Emergency shutdown is in force; nothing was actuated
    Halted,
    /// No measured sample yet
    AwaitingSample(SampleStatus),
    /// No sample taken entirely after the last actuation
    Settling,
    Planned {
        decomposition: Decomposition,
        cpu: Adjustment,
        bandwidth: Adjustment,
    },
}

#[derive(Debug, Default)]
struct CpuSlot {
    phase: ActuatorPhase,
    /// Last command issued; kept while degraded so recovery can restart it
    command: CpuCommand,
    handle: Option<ActuatorHandle>,
    violations: u32,
}

#[derive(Debug, Default)]
struct BandwidthSlot {
    phase: ActuatorPhase,
    command: BandwidthCommand,
    /// Synthetic rate the command was sized for
    synthetic_mbps: f64,
    handles: Vec<ActuatorHandle>,
    violations: u32,
}

/// Closed-loop controller owning actuator handles and the commanded state
pub struct Controller {
    settings: Arc<LoadSettings>,
    translator: ParameterTranslator,
    actuator: Arc<dyn Actuator>,
    store: Arc<StateStore>,
    samples: watch::Receiver<RateSample>,
    commands: mpsc::Receiver<ControlCommand>,
    committed: SyntheticLoadState,
    /// When the committed state last changed
    last_actuation: Option<Instant>,
    cpu: CpuSlot,
    bandwidth: BandwidthSlot,
    halted: bool,
    health: Option<HealthRegistry>,
    settings_tx: Option<watch::Sender<Arc<LoadSettings>>>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl Controller {
    /// Create a controller and the sender for its command channel
    pub fn new(
        settings: Arc<LoadSettings>,
        actuator: Arc<dyn Actuator>,
        store: Arc<StateStore>,
        samples: watch::Receiver<RateSample>,
    ) -> (Self, mpsc::Sender<ControlCommand>) {
        let (command_tx, commands) = mpsc::channel(8);
        let logger = StructuredLogger::new(settings.node_name.clone());

        let controller = Self {
            translator: translator_for(&settings),
            settings,
            actuator,
            store,
            samples,
            commands,
            committed: SyntheticLoadState::default(),
            last_actuation: None,
            cpu: CpuSlot::default(),
            bandwidth: BandwidthSlot::default(),
            halted: false,
            health: None,
            settings_tx: None,
            metrics: AgentMetrics::new(),
            logger,
        };
        (controller, command_tx)
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Publish settings to `tx` once a reload has been applied
    pub fn with_settings_publisher(mut self, tx: watch::Sender<Arc<LoadSettings>>) -> Self {
        self.settings_tx = Some(tx);
        self
    }

    pub fn settings(&self) -> &Arc<LoadSettings> {
        &self.settings
    }

    /// Last state this controller committed
    pub fn committed(&self) -> SyntheticLoadState {
        self.committed
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn phase(&self, dimension: Dimension) -> ActuatorPhase {
        match dimension {
            Dimension::Cpu => self.cpu.phase,
            Dimension::Bandwidth => self.bandwidth.phase,
        }
    }

    pub fn cpu_command(&self) -> CpuCommand {
        self.cpu.command
    }

    pub fn bandwidth_command(&self) -> BandwidthCommand {
        self.bandwidth.command
    }

    /// Run until shutdown is requested by signal or command
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.settings.adjustment_interval().as_millis() as u64,
            cores = self.translator.cores,
            "Starting control loop"
        );

        // Service start: nothing is commanded yet
        self.commit(SyntheticLoadState::default()).await;

        let mut ticker = interval(self.settings.adjustment_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Control cycle failed");
                    }
                }
                Some(command) = self.commands.recv() => {
                    match command {
                        ControlCommand::Reload(settings) => {
                            self.reload(settings).await;
                            ticker = interval(self.settings.adjustment_interval());
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        }
                        ControlCommand::Shutdown => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    self.shutdown().await;
                    break;
                }
            }
        }
        info!("Control loop stopped");
    }

    /// Execute one control cycle
    pub async fn run_cycle(&mut self) -> ControlResult<CycleOutcome> {
        if self.halted {
            debug!("Controller halted, skipping cycle");
            return Ok(CycleOutcome::Halted);
        }

        let started = Instant::now();
        let fresh = self.samples.has_changed().unwrap_or(false);
        let sample = *self.samples.borrow_and_update();
        if matches!(
            sample.status,
            SampleStatus::Uninitialized | SampleStatus::Baseline
        ) {
            debug!(status = ?sample.status, "No measured sample yet");
            return Ok(CycleOutcome::AwaitingSample(sample.status));
        }

        self.supervise().await;

        // Rates read before the last start or stop still include the old load
        let settled = self
            .last_actuation
            .map_or(true, |at| sample.measured_since(at));
        if !fresh || !settled {
            debug!(
                status = ?sample.status,
                fresh,
                "No sample since the last actuation, skipping planning"
            );
            return Ok(CycleOutcome::Settling);
        }

        let state = self.load_state().await;
        let decomposition = decompose(&sample, &state);
        let target = self.settings.target();

        if let Err(e) = self.check_safety(&decomposition, &state, &target) {
            self.emergency_shutdown(&e).await;
            return Err(e);
        }

        let mut cpu = plan_adjustment(
            target.cpu_target_percent,
            decomposition.cpu.total,
            decomposition.cpu.organic,
            SafetyClamp::new(target.max_cpu_percent),
            target.min_adjustment_threshold,
        );
        let mut bandwidth = plan_adjustment(
            target.bandwidth_target_mbps,
            decomposition.bw_total.total,
            decomposition.bw_total.organic,
            SafetyClamp::new(target.max_bandwidth_mbps),
            target.min_adjustment_threshold,
        );

        // Replayed rates may only lower synthetic load
        if sample.status == SampleStatus::Stale {
            cpu = cpu.hold_increase(state.cpu_percent);
            bandwidth = bandwidth.hold_increase(state.bw_total_mbps);
        }

        debug!(
            cpu_total = decomposition.cpu.total,
            cpu_organic = decomposition.cpu.organic,
            cpu_gap = cpu.gap,
            bw_total = decomposition.bw_total.total,
            bw_organic = decomposition.bw_total.organic,
            bw_gap = bandwidth.gap,
            "Planned adjustments"
        );

        let mut first_error = None;
        if let Some(synthetic) = cpu.synthetic {
            if let Err(e) = self.apply_cpu(self.translator.cpu(synthetic)).await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(synthetic) = bandwidth.synthetic {
            let command = self.translator.bandwidth(synthetic);
            if let Err(e) = self.apply_bandwidth(command, synthetic).await {
                first_error.get_or_insert(e);
            }
        }

        self.metrics
            .observe_cycle_latency(started.elapsed().as_secs_f64());

        match first_error {
            Some(e) => Err(e),
            None => Ok(CycleOutcome::Planned {
                decomposition,
                cpu,
                bandwidth,
            }),
        }
    }

    /// Stop every actuator gracefully and commit the zero state
    pub async fn shutdown(&mut self) {
        info!("Stopping synthetic load");
        self.stop_all().await;
    }

    /// Stop actuators, commit zero state and swap in new settings
    pub async fn reload(&mut self, settings: Arc<LoadSettings>) {
        if let Err(e) = settings.validate() {
            self.logger.log_config_reloaded(false, &e.to_string());
            return;
        }

        self.stop_all().await;
        self.translator = translator_for(&settings);
        self.settings = settings;
        self.halted = false;
        self.cpu.violations = 0;
        self.bandwidth.violations = 0;

        if let Some(tx) = &self.settings_tx {
            tx.send_replace(Arc::clone(&self.settings));
        }
        self.set_health(components::CONTROLLER, None).await;
        self.logger.log_config_reloaded(
            true,
            &format!(
                "cpu_target_percent={} bandwidth_target_mbps={}",
                self.settings.cpu_target_percent, self.settings.bandwidth_target_mbps
            ),
        );
    }

    /// Kill all synthetic load immediately and halt until reload
    pub async fn emergency_shutdown(&mut self, reason: &ControlError) {
        self.logger.log_emergency_shutdown(&reason.to_string());
        self.metrics.inc_emergency_shutdowns();

        self.actuator.kill_all().await;

        self.cpu.handle = None;
        self.cpu.command = CpuCommand::OFF;
        self.cpu.violations = 0;
        self.advance(Dimension::Cpu, PhaseEvent::Emergency);

        self.bandwidth.handles.clear();
        self.bandwidth.command = BandwidthCommand::OFF;
        self.bandwidth.synthetic_mbps = 0.0;
        self.bandwidth.violations = 0;
        self.advance(Dimension::Bandwidth, PhaseEvent::Emergency);

        self.commit(SyntheticLoadState::default()).await;
        self.halted = true;

        self.set_health(
            components::CONTROLLER,
            Some((true, format!("emergency shutdown: {reason}"))),
        )
        .await;
    }

    async fn stop_all(&mut self) {
        if let Some(handle) = self.cpu.handle.take() {
            if let Err(e) = self.actuator.stop_cpu(handle).await {
                warn!(error = %e, "Failed to stop CPU load generator");
            }
        }
        self.cpu.command = CpuCommand::OFF;
        self.advance(Dimension::Cpu, PhaseEvent::Stop);

        let handles = std::mem::take(&mut self.bandwidth.handles);
        if !handles.is_empty() {
            if let Err(e) = self.actuator.stop_bandwidth(handles).await {
                warn!(error = %e, "Failed to stop bandwidth load generators");
            }
        }
        self.bandwidth.command = BandwidthCommand::OFF;
        self.bandwidth.synthetic_mbps = 0.0;
        self.advance(Dimension::Bandwidth, PhaseEvent::Stop);

        self.commit(SyntheticLoadState::default()).await;
    }

    /// Re-actuate CPU if `command` differs from the one running
    async fn apply_cpu(&mut self, command: CpuCommand) -> ControlResult<()> {
        if self.cpu.phase.is_degraded() {
            debug!("CPU actuator degraded, adjustment deferred to recovery");
            return Ok(());
        }
        if command == self.cpu.command {
            return Ok(());
        }

        if let Some(handle) = self.cpu.handle.take() {
            if let Err(e) = self.actuator.stop_cpu(handle).await {
                warn!(error = %e, "Failed to stop CPU load generator");
            }
            self.cpu.command = CpuCommand::OFF;
            self.advance(Dimension::Cpu, PhaseEvent::Stop);
            let state = self.committed.with_cpu(&CpuCommand::OFF, self.translator.cores);
            self.commit(state).await;
        }

        if command.is_off() {
            self.cpu.command = CpuCommand::OFF;
            self.logger.log_cpu_actuation(&command, 0.0);
            self.metrics.inc_actuations(Dimension::Cpu);
            return Ok(());
        }

        self.advance(Dimension::Cpu, PhaseEvent::Command);
        match self.actuator.start_cpu(&command).await {
            Ok(handle) => {
                self.cpu.handle = Some(handle);
                self.cpu.command = command;
                self.advance(Dimension::Cpu, PhaseEvent::Confirmed);

                let state = self.committed.with_cpu(&command, self.translator.cores);
                self.commit(state).await;

                self.logger
                    .log_cpu_actuation(&command, state.cpu_percent);
                self.metrics.inc_actuations(Dimension::Cpu);
                self.set_health(components::CPU_ACTUATOR, None).await;
                Ok(())
            }
            Err(e) => {
                self.advance(Dimension::Cpu, PhaseEvent::StartFailed);
                warn!(error = %e, workers = command.workers, "CPU actuation failed");
                self.set_health(components::CPU_ACTUATOR, Some((false, e.to_string())))
                    .await;
                Err(e)
            }
        }
    }

    /// Re-actuate bandwidth if `command` differs from the one running
    async fn apply_bandwidth(
        &mut self,
        command: BandwidthCommand,
        synthetic_mbps: f64,
    ) -> ControlResult<()> {
        if self.bandwidth.phase.is_degraded() {
            debug!("Bandwidth actuator degraded, adjustment deferred to recovery");
            return Ok(());
        }
        if command == self.bandwidth.command {
            return Ok(());
        }

        let handles = std::mem::take(&mut self.bandwidth.handles);
        if !handles.is_empty() {
            if let Err(e) = self.actuator.stop_bandwidth(handles).await {
                warn!(error = %e, "Failed to stop bandwidth load generators");
            }
            self.bandwidth.command = BandwidthCommand::OFF;
            self.bandwidth.synthetic_mbps = 0.0;
            self.advance(Dimension::Bandwidth, PhaseEvent::Stop);
            let state = self.committed.with_bandwidth(&BandwidthCommand::OFF, 0.0);
            self.commit(state).await;
        }

        if command.is_off() {
            self.bandwidth.command = BandwidthCommand::OFF;
            self.logger.log_bandwidth_actuation(&command, 0.0);
            self.metrics.inc_actuations(Dimension::Bandwidth);
            return Ok(());
        }

        self.advance(Dimension::Bandwidth, PhaseEvent::Command);
        match self
            .actuator
            .start_bandwidth(&command, &self.settings.download_url_pool)
            .await
        {
            Ok(handles) => {
                self.bandwidth.handles = handles;
                self.bandwidth.command = command;
                self.bandwidth.synthetic_mbps = synthetic_mbps;
                self.advance(Dimension::Bandwidth, PhaseEvent::Confirmed);

                let state = self.committed.with_bandwidth(&command, synthetic_mbps);
                self.commit(state).await;

                self.logger
                    .log_bandwidth_actuation(&command, synthetic_mbps);
                self.metrics.inc_actuations(Dimension::Bandwidth);
                self.set_health(components::BANDWIDTH_ACTUATOR, None).await;
                Ok(())
            }
            Err(e) => {
                self.advance(Dimension::Bandwidth, PhaseEvent::StartFailed);
                warn!(
                    error = %e,
                    downloaders = command.downloaders,
                    "Bandwidth actuation failed"
                );
                self.set_health(
                    components::BANDWIDTH_ACTUATOR,
                    Some((false, e.to_string())),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Per-cycle health check of running actuators, with recovery
    async fn supervise(&mut self) {
        if self.cpu.phase == ActuatorPhase::Steady {
            if let Some(handle) = self.cpu.handle {
                if !self.actuator.is_alive(&handle).await {
                    self.on_cpu_died(handle).await;
                }
            }
        }
        if self.cpu.phase == ActuatorPhase::Degraded {
            self.recover_cpu().await;
        }

        if self.bandwidth.phase == ActuatorPhase::Steady {
            let mut dead = None;
            for handle in &self.bandwidth.handles {
                if !self.actuator.is_alive(handle).await {
                    dead = Some(*handle);
                    break;
                }
            }
            if let Some(handle) = dead {
                self.on_bandwidth_died(handle).await;
            }
        }
        if self.bandwidth.phase == ActuatorPhase::Degraded {
            self.recover_bandwidth().await;
        }
    }

    async fn on_cpu_died(&mut self, handle: ActuatorHandle) {
        let err = ControlError::ActuatorDied(format!("cpu generator pid {:?}", handle.pid));
        self.logger.log_actuator_died(Dimension::Cpu, handle.pid);
        self.advance(Dimension::Cpu, PhaseEvent::HealthCheckFailed);

        // Reap the exited process and anything left in its group
        self.cpu.handle = None;
        if let Err(e) = self.actuator.stop_cpu(handle).await {
            warn!(error = %e, "Failed to reap CPU load generator");
        }

        let state = self.committed.with_cpu(&CpuCommand::OFF, self.translator.cores);
        self.commit(state).await;
        self.set_health(components::CPU_ACTUATOR, Some((false, err.to_string())))
            .await;
    }

    async fn recover_cpu(&mut self) {
        let command = self.cpu.command;
        self.advance(Dimension::Cpu, PhaseEvent::RecoveryStarted);

        match self.actuator.start_cpu(&command).await {
            Ok(handle) => {
                self.cpu.handle = Some(handle);
                self.advance(Dimension::Cpu, PhaseEvent::Recovered);
                let state = self.committed.with_cpu(&command, self.translator.cores);
                self.commit(state).await;
                info!(pid = ?handle.pid, "CPU load generator restarted");
                self.set_health(components::CPU_ACTUATOR, None).await;
            }
            Err(e) => {
                self.advance(Dimension::Cpu, PhaseEvent::RecoveryFailed);
                warn!(error = %e, "CPU load generator restart failed, retrying next cycle");
            }
        }
    }

    async fn on_bandwidth_died(&mut self, handle: ActuatorHandle) {
        let err = ControlError::ActuatorDied(format!("downloader pid {:?}", handle.pid));
        self.logger
            .log_actuator_died(Dimension::Bandwidth, handle.pid);
        self.advance(Dimension::Bandwidth, PhaseEvent::HealthCheckFailed);

        // Downloaders are restarted as a set
        let handles = std::mem::take(&mut self.bandwidth.handles);
        if let Err(e) = self.actuator.stop_bandwidth(handles).await {
            warn!(error = %e, "Failed to reap bandwidth load generators");
        }

        let state = self.committed.with_bandwidth(&BandwidthCommand::OFF, 0.0);
        self.commit(state).await;
        self.set_health(
            components::BANDWIDTH_ACTUATOR,
            Some((false, err.to_string())),
        )
        .await;
    }

    async fn recover_bandwidth(&mut self) {
        let command = self.bandwidth.command;
        let synthetic_mbps = self.bandwidth.synthetic_mbps;
        self.advance(Dimension::Bandwidth, PhaseEvent::RecoveryStarted);

        match self
            .actuator
            .start_bandwidth(&command, &self.settings.download_url_pool)
            .await
        {
            Ok(handles) => {
                self.bandwidth.handles = handles;
                self.advance(Dimension::Bandwidth, PhaseEvent::Recovered);
                let state = self.committed.with_bandwidth(&command, synthetic_mbps);
                self.commit(state).await;
                info!(
                    downloaders = command.downloaders,
                    "Bandwidth load generators restarted"
                );
                self.set_health(components::BANDWIDTH_ACTUATOR, None).await;
            }
            Err(e) => {
                self.advance(Dimension::Bandwidth, PhaseEvent::RecoveryFailed);
                warn!(error = %e, "Downloader restart failed, retrying next cycle");
            }
        }
    }

    /// Count consecutive cycles above the ceiling while synthetic load runs
    fn check_safety(
        &mut self,
        decomposition: &Decomposition,
        state: &SyntheticLoadState,
        target: &ControlTarget,
    ) -> ControlResult<()> {
        let limit = self.settings.safety_violation_limit;

        let checks = [
            (
                Dimension::Cpu,
                decomposition.cpu.total,
                target.max_cpu_percent,
                state.cpu_percent > 0.0,
            ),
            (
                Dimension::Bandwidth,
                decomposition.bw_total.total,
                target.max_bandwidth_mbps,
                state.bw_total_mbps > 0.0,
            ),
        ];

        for (dimension, measured, max, has_synthetic) in checks {
            let violated = has_synthetic && SafetyClamp::new(max).violated_by(measured);
            let counter = match dimension {
                Dimension::Cpu => &mut self.cpu.violations,
                Dimension::Bandwidth => &mut self.bandwidth.violations,
            };

            if !violated {
                *counter = 0;
                continue;
            }

            *counter += 1;
            let consecutive = *counter;
            self.metrics.inc_safety_violations(dimension);
            self.logger
                .log_safety_violation(dimension, measured, max, consecutive, limit);

            if consecutive >= limit {
                return Err(ControlError::SafetyViolationRepeated {
                    dimension: dimension.to_string(),
                    cycles: consecutive,
                });
            }
        }
        Ok(())
    }

    /// Latest shared state, falling back to the in-memory copy
    async fn load_state(&mut self) -> SyntheticLoadState {
        match self.store.load() {
            Ok(snapshot) => snapshot.state,
            Err(e) => {
                warn!(error = %e, "Failed to load shared state, using last committed copy");
                self.metrics.inc_state_store_errors();
                self.set_health(components::STATE_STORE, Some((false, e.to_string())))
                    .await;
                self.committed
            }
        }
    }

    async fn commit(&mut self, state: SyntheticLoadState) {
        if state != self.committed {
            self.last_actuation = Some(Instant::now());
        }
        self.committed = state;
        match self.store.commit(&state) {
            Ok(_) => self.set_health(components::STATE_STORE, None).await,
            Err(e) => {
                error!(error = %e, "Failed to persist synthetic load state");
                self.metrics.inc_state_store_errors();
                self.set_health(components::STATE_STORE, Some((false, e.to_string())))
                    .await;
            }
        }
    }

    fn advance(&mut self, dimension: Dimension, event: PhaseEvent) {
        let phase = match dimension {
            Dimension::Cpu => &mut self.cpu.phase,
            Dimension::Bandwidth => &mut self.bandwidth.phase,
        };
        match phase.on(event) {
            Ok(next) => {
                if next != *phase {
                    debug!(dimension = %dimension, from = %phase, to = %next, "Actuator phase change");
                }
                *phase = next;
                self.metrics
                    .set_actuator_phase(dimension, &next.to_string());
            }
            Err(e) => warn!(dimension = %dimension, error = %e, "Ignoring phase event"),
        }
    }

    /// `None` marks healthy; `Some((unhealthy, message))` otherwise
    async fn set_health(&self, component: &str, problem: Option<(bool, String)>) {
        let Some(health) = &self.health else {
            return;
        };
        match problem {
            None => health.set_healthy(component).await,
            Some((true, message)) => health.set_unhealthy(component, message).await,
            Some((false, message)) => health.set_degraded(component, message).await,
        }
    }
}

fn translator_for(settings: &LoadSettings) -> ParameterTranslator {
    ParameterTranslator::new(settings.effective_cores(), settings.per_server_expected_mbps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use url::Url;

    /// Records calls instead of spawning processes
    #[derive(Default)]
    struct MockActuator {
        next_id: AtomicU64,
        cpu_starts: Mutex<Vec<CpuCommand>>,
        bw_starts: Mutex<Vec<BandwidthCommand>>,
        stops: AtomicU64,
        kill_all_calls: AtomicU64,
        dead: Mutex<HashSet<u64>>,
        fail_starts: AtomicBool,
        running: Mutex<HashSet<u64>>,
    }

    impl MockActuator {
        fn handle(&self, dimension: Dimension) -> ActuatorHandle {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.running.lock().unwrap().insert(id);
            ActuatorHandle {
                id,
                dimension,
                pid: Some(1000 + id as u32),
            }
        }

        fn kill_running(&self) {
            let running = self.running.lock().unwrap();
            self.dead.lock().unwrap().extend(running.iter().copied());
        }

        fn cpu_starts(&self) -> Vec<CpuCommand> {
            self.cpu_starts.lock().unwrap().clone()
        }

        fn bw_starts(&self) -> Vec<BandwidthCommand> {
            self.bw_starts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Actuator for MockActuator {
        async fn start_cpu(&self, command: &CpuCommand) -> ControlResult<ActuatorHandle> {
            if self.fail_starts.load(Ordering::SeqCst) {
                return Err(ControlError::ActuatorUnavailable {
                    tool: "stress-ng".to_string(),
                });
            }
            self.cpu_starts.lock().unwrap().push(*command);
            Ok(self.handle(Dimension::Cpu))
        }

        async fn stop_cpu(&self, handle: ActuatorHandle) -> ControlResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.lock().unwrap().remove(&handle.id);
            Ok(())
        }

        async fn start_bandwidth(
            &self,
            command: &BandwidthCommand,
            url_pool: &[Url],
        ) -> ControlResult<Vec<ActuatorHandle>> {
            if self.fail_starts.load(Ordering::SeqCst) || url_pool.is_empty() {
                return Err(ControlError::ActuatorUnavailable {
                    tool: "curl".to_string(),
                });
            }
            self.bw_starts.lock().unwrap().push(*command);
            Ok((0..command.downloaders)
                .map(|_| self.handle(Dimension::Bandwidth))
                .collect())
        }

        async fn stop_bandwidth(&self, handles: Vec<ActuatorHandle>) -> ControlResult<()> {
            for handle in handles {
                self.stops.fetch_add(1, Ordering::SeqCst);
                self.running.lock().unwrap().remove(&handle.id);
            }
            Ok(())
        }

        async fn is_alive(&self, handle: &ActuatorHandle) -> bool {
            !self.dead.lock().unwrap().contains(&handle.id)
        }

        async fn kill_all(&self) {
            self.kill_all_calls.fetch_add(1, Ordering::SeqCst);
            self.running.lock().unwrap().clear();
        }
    }

    struct Harness {
        controller: Controller,
        actuator: Arc<MockActuator>,
        store: Arc<StateStore>,
        samples: watch::Sender<RateSample>,
        _dir: TempDir,
    }

    fn settings() -> LoadSettings {
        LoadSettings {
            cpu_target_percent: 50.0,
            max_cpu_percent: 90.0,
            bandwidth_target_mbps: 0.0,
            max_bandwidth_mbps: 1000.0,
            min_adjustment_threshold: 5.0,
            cpu_cores: 4,
            download_url_pool: vec![
                Url::parse("http://a.example.com/1GB.bin").unwrap(),
                Url::parse("http://b.example.com/1GB.bin").unwrap(),
            ],
            ..Default::default()
        }
    }

    fn harness(settings: LoadSettings) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let actuator = Arc::new(MockActuator::default());
        let (samples, sample_rx) = watch::channel(RateSample::default());
        let (controller, _commands) = Controller::new(
            Arc::new(settings),
            actuator.clone(),
            store.clone(),
            sample_rx,
        );
        Harness {
            controller,
            actuator,
            store,
            samples,
            _dir: dir,
        }
    }

    fn measured(cpu_percent: f64, total_mbps: f64) -> RateSample {
        RateSample {
            cpu_percent,
            rx_mbps: total_mbps,
            tx_mbps: 0.0,
            total_mbps,
            status: SampleStatus::Measured,
            window_start: Some(Instant::now()),
        }
    }

    fn stale(cpu_percent: f64, total_mbps: f64) -> RateSample {
        RateSample {
            status: SampleStatus::Stale,
            window_start: None,
            ..measured(cpu_percent, total_mbps)
        }
    }

    #[tokio::test]
    async fn test_waits_for_measured_sample() {
        let mut h = harness(settings());
        let outcome = h.controller.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::AwaitingSample(SampleStatus::Uninitialized)
        );

        h.samples.send_replace(RateSample::zero(SampleStatus::Baseline));
        let outcome = h.controller.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::AwaitingSample(SampleStatus::Baseline));
        assert!(h.actuator.cpu_starts().is_empty());
    }

    #[tokio::test]
    async fn test_cpu_gap_closed_with_one_worker_per_core() {
        let mut h = harness(settings());
        h.samples.send_replace(measured(30.0, 0.0));

        let outcome = h.controller.run_cycle().await.unwrap();
        match outcome {
            CycleOutcome::Planned { cpu, .. } => {
                assert_eq!(cpu.gap, 20.0);
                assert_eq!(cpu.synthetic, Some(20.0));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        assert_eq!(
            h.actuator.cpu_starts(),
            vec![CpuCommand {
                workers: 4,
                load_percent: 20
            }]
        );
        assert_eq!(h.controller.phase(Dimension::Cpu), ActuatorPhase::Steady);

        let snapshot = h.store.load().unwrap();
        assert_eq!(snapshot.state.cpu_workers, 4);
        assert_eq!(snapshot.state.cpu_load_percent_per_worker, 20);
        assert!((snapshot.state.cpu_percent - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_same_command_does_not_reactuate() {
        let mut s = settings();
        s.min_adjustment_threshold = 0.0;
        let mut h = harness(s);

        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();
        let version = h.store.load().unwrap().version;

        // 30 organic + 20 synthetic: gap 0 fires but translates identically
        h.samples.send_replace(measured(50.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        assert_eq!(h.actuator.cpu_starts().len(), 1);
        assert_eq!(h.actuator.stops.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.load().unwrap().version, version);
    }

    #[tokio::test]
    async fn test_hysteresis_holds_command() {
        let mut h = harness(settings());
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        h.samples.send_replace(measured(47.0, 0.0));
        let outcome = h.controller.run_cycle().await.unwrap();
        match outcome {
            CycleOutcome::Planned { cpu, .. } => assert_eq!(cpu.synthetic, None),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.actuator.cpu_starts().len(), 1);
    }

    #[tokio::test]
    async fn test_reactuation_stops_previous_generator() {
        let mut h = harness(settings());
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        // Organic grew to 40: 60 total, synthetic drops to 10
        h.samples.send_replace(measured(60.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        assert_eq!(h.actuator.stops.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.actuator.cpu_starts().last(),
            Some(&CpuCommand {
                workers: 4,
                load_percent: 10
            })
        );
        assert!((h.store.load().unwrap().state.cpu_percent - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_target_reached_organically_stops_load() {
        let mut h = harness(settings());
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        // Organic alone now 70
        h.samples.send_replace(measured(90.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        assert_eq!(h.controller.cpu_command(), CpuCommand::OFF);
        assert_eq!(h.controller.phase(Dimension::Cpu), ActuatorPhase::Idle);
        assert!(h.store.load().unwrap().state.is_idle());
    }

    #[tokio::test]
    async fn test_unavailable_actuator_leaves_state() {
        let mut h = harness(settings());
        h.actuator.fail_starts.store(true, Ordering::SeqCst);
        h.samples.send_replace(measured(30.0, 0.0));

        let result = h.controller.run_cycle().await;
        assert!(matches!(
            result,
            Err(ControlError::ActuatorUnavailable { .. })
        ));
        assert_eq!(h.controller.phase(Dimension::Cpu), ActuatorPhase::Idle);
        assert!(h.controller.committed().is_idle());
        assert!(h.store.load().unwrap().state.is_idle());

        // Retried once the tool appears
        h.actuator.fail_starts.store(false, Ordering::SeqCst);
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();
        assert_eq!(h.controller.phase(Dimension::Cpu), ActuatorPhase::Steady);
    }

    #[tokio::test]
    async fn test_bandwidth_unlimited_mode() {
        let mut s = settings();
        s.cpu_target_percent = 0.0;
        s.bandwidth_target_mbps = 1000.0;
        s.max_bandwidth_mbps = 1200.0;
        let mut h = harness(s);

        h.samples.send_replace(measured(10.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        assert_eq!(
            h.actuator.bw_starts(),
            vec![BandwidthCommand {
                downloaders: 2,
                rate_mbps_per_downloader: 0.0
            }]
        );
        let state = h.store.load().unwrap().state;
        assert_eq!(state.bw_downloaders, 2);
        assert_eq!(state.bw_rate_per_downloader_mbps, 0.0);
        assert!((state.bw_total_mbps - 1000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_recovers_dead_actuator() {
        let mut h = harness(settings());
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        h.actuator.kill_running();
        h.samples.send_replace(measured(50.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        assert_eq!(h.actuator.cpu_starts().len(), 2);
        assert_eq!(h.controller.phase(Dimension::Cpu), ActuatorPhase::Steady);
        assert!((h.store.load().unwrap().state.cpu_percent - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_recovery_stays_degraded() {
        let health = HealthRegistry::new();
        health.register_all().await;

        let mut h = harness(settings());
        h.controller = h.controller.with_health(health.clone());
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        h.actuator.kill_running();
        h.actuator.fail_starts.store(true, Ordering::SeqCst);
        h.samples.send_replace(measured(50.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        assert_eq!(h.controller.phase(Dimension::Cpu), ActuatorPhase::Degraded);
        // The dead load is no longer counted as synthetic
        assert_eq!(h.store.load().unwrap().state.cpu_percent, 0.0);
        let report = health.health().await;
        assert_eq!(
            report.components[components::CPU_ACTUATOR].status,
            ComponentStatus::Degraded
        );

        h.actuator.fail_starts.store(false, Ordering::SeqCst);
        h.samples.send_replace(measured(50.0, 0.0));
        h.controller.run_cycle().await.unwrap();
        assert_eq!(h.controller.phase(Dimension::Cpu), ActuatorPhase::Steady);
        assert!((h.store.load().unwrap().state.cpu_percent - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_repeated_violation_triggers_emergency_shutdown() {
        let mut s = settings();
        s.cpu_target_percent = 0.0;
        s.bandwidth_target_mbps = 900.0;
        s.max_bandwidth_mbps = 1000.0;
        let mut h = harness(s);

        h.samples.send_replace(measured(10.0, 0.0));
        h.controller.run_cycle().await.unwrap();
        assert_eq!(h.actuator.bw_starts().len(), 1);

        // Unlimited downloaders overshoot; the resized command is identical
        for _ in 0..2 {
            h.samples.send_replace(measured(10.0, 1100.0));
            h.controller.run_cycle().await.unwrap();
        }
        h.samples.send_replace(measured(10.0, 1100.0));
        let result = h.controller.run_cycle().await;

        assert!(matches!(
            result,
            Err(ControlError::SafetyViolationRepeated { cycles: 3, .. })
        ));
        assert!(h.controller.is_halted());
        assert_eq!(h.actuator.kill_all_calls.load(Ordering::SeqCst), 1);
        assert!(h.store.load().unwrap().state.is_idle());
        assert_eq!(
            h.controller.phase(Dimension::Bandwidth),
            ActuatorPhase::Idle
        );

        // Halted: no further actuation
        h.samples.send_replace(measured(10.0, 0.0));
        assert_eq!(h.controller.run_cycle().await.unwrap(), CycleOutcome::Halted);
        assert_eq!(h.actuator.bw_starts().len(), 1);
    }

    #[tokio::test]
    async fn test_violation_count_resets() {
        let mut s = settings();
        s.cpu_target_percent = 0.0;
        s.bandwidth_target_mbps = 900.0;
        s.max_bandwidth_mbps = 1000.0;
        let mut h = harness(s);

        h.samples.send_replace(measured(10.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        for _ in 0..2 {
            h.samples.send_replace(measured(10.0, 1100.0));
            h.controller.run_cycle().await.unwrap();
        }
        h.samples.send_replace(measured(10.0, 950.0));
        h.controller.run_cycle().await.unwrap();
        h.samples.send_replace(measured(10.0, 1100.0));
        h.controller.run_cycle().await.unwrap();

        assert!(!h.controller.is_halted());
    }

    #[tokio::test]
    async fn test_reload_stops_and_swaps_settings() {
        let mut h = harness(settings());
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        let mut next = settings();
        next.cpu_target_percent = 70.0;
        h.controller.reload(Arc::new(next)).await;

        assert_eq!(h.actuator.stops.load(Ordering::SeqCst), 1);
        assert!(h.store.load().unwrap().state.is_idle());
        assert_eq!(h.controller.settings().cpu_target_percent, 70.0);
        assert_eq!(h.controller.phase(Dimension::Cpu), ActuatorPhase::Idle);

        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();
        assert_eq!(
            h.actuator.cpu_starts().last(),
            Some(&CpuCommand {
                workers: 4,
                load_percent: 40
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_reload_is_ignored() {
        let mut h = harness(settings());
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        let mut bad = settings();
        bad.max_cpu_percent = 10.0;
        h.controller.reload(Arc::new(bad)).await;

        assert_eq!(h.controller.settings().max_cpu_percent, 90.0);
        assert_eq!(h.controller.phase(Dimension::Cpu), ActuatorPhase::Steady);
        assert_eq!(h.actuator.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_sample_never_raises_load() {
        let mut h = harness(settings());
        h.samples.send_replace(stale(30.0, 0.0));

        for _ in 0..3 {
            let outcome = h.controller.run_cycle().await.unwrap();
            if let CycleOutcome::Planned { cpu, .. } = outcome {
                assert_eq!(cpu.synthetic, None);
            }
            h.samples.send_replace(stale(30.0, 0.0));
        }

        assert!(h.actuator.cpu_starts().is_empty());
        assert!(h.controller.committed().is_idle());
    }

    #[tokio::test]
    async fn test_stale_sample_after_actuation_settles() {
        let mut h = harness(settings());
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        // Replayed rates cannot show the load just started
        h.samples.send_replace(stale(90.0, 0.0));
        assert_eq!(h.controller.run_cycle().await.unwrap(), CycleOutcome::Settling);
        assert_eq!(h.controller.cpu_command().load_percent, 20);
        assert_eq!(h.actuator.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_waits_for_sample_after_actuation() {
        let mut h = harness(settings());
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();
        assert_eq!(h.actuator.cpu_starts().len(), 1);

        // Same sample again: it predates the start
        for _ in 0..3 {
            assert_eq!(h.controller.run_cycle().await.unwrap(), CycleOutcome::Settling);
        }

        // A sample re-sent without a new window is still too old
        let before_start = RateSample {
            window_start: Some(Instant::now() - std::time::Duration::from_secs(5)),
            ..measured(30.0, 0.0)
        };
        h.samples.send_replace(before_start);
        assert_eq!(h.controller.run_cycle().await.unwrap(), CycleOutcome::Settling);
        assert_eq!(h.actuator.cpu_starts().len(), 1);
        assert_eq!(h.actuator.stops.load(Ordering::SeqCst), 0);

        h.samples.send_replace(measured(50.0, 0.0));
        assert!(matches!(
            h.controller.run_cycle().await.unwrap(),
            CycleOutcome::Planned { .. }
        ));
    }

    #[tokio::test]
    async fn test_bandwidth_downloaders_restart_as_a_set() {
        let health = HealthRegistry::new();
        health.register_all().await;

        let mut s = settings();
        s.cpu_target_percent = 0.0;
        s.bandwidth_target_mbps = 1000.0;
        s.max_bandwidth_mbps = 1200.0;
        let mut h = harness(s);
        h.controller = h.controller.with_health(health.clone());

        h.samples.send_replace(measured(10.0, 0.0));
        h.controller.run_cycle().await.unwrap();
        let command = h.controller.bandwidth_command();
        assert_eq!(command.downloaders, 2);
        let version = h.store.load().unwrap().version;

        // One downloader dies and the restart fails: the set is reaped
        h.actuator.kill_running();
        h.actuator.fail_starts.store(true, Ordering::SeqCst);
        h.samples.send_replace(measured(10.0, 1000.0));
        h.controller.run_cycle().await.unwrap();

        assert_eq!(
            h.controller.phase(Dimension::Bandwidth),
            ActuatorPhase::Degraded
        );
        assert_eq!(h.actuator.stops.load(Ordering::SeqCst), 2);
        let snapshot = h.store.load().unwrap();
        assert!(snapshot.version > version);
        assert_eq!(snapshot.state.bw_total_mbps, 0.0);
        assert_eq!(snapshot.state.bw_downloaders, 0);
        assert_eq!(
            health.health().await.components[components::BANDWIDTH_ACTUATOR].status,
            ComponentStatus::Degraded
        );

        // Next cycle restarts the whole set with the same command
        h.actuator.fail_starts.store(false, Ordering::SeqCst);
        h.samples.send_replace(measured(10.0, 0.0));
        h.controller.run_cycle().await.unwrap();

        assert_eq!(h.actuator.bw_starts(), vec![command, command]);
        assert_eq!(
            h.controller.phase(Dimension::Bandwidth),
            ActuatorPhase::Steady
        );
        let state = h.store.load().unwrap().state;
        assert_eq!(state.bw_downloaders, 2);
        assert!((state.bw_total_mbps - 1000.0).abs() < 1e-9);
        assert_eq!(
            health.health().await.components[components::BANDWIDTH_ACTUATOR].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_reload_publishes_applied_settings() {
        let mut h = harness(settings());
        let (settings_tx, mut settings_rx) = watch::channel(Arc::new(settings()));
        h.controller = h.controller.with_settings_publisher(settings_tx);

        let mut bad = settings();
        bad.max_cpu_percent = 10.0;
        h.controller.reload(Arc::new(bad)).await;
        assert!(!settings_rx.has_changed().unwrap());

        let mut next = settings();
        next.cpu_target_percent = 70.0;
        h.controller.reload(Arc::new(next)).await;
        assert!(settings_rx.has_changed().unwrap());
        assert_eq!(settings_rx.borrow_and_update().cpu_target_percent, 70.0);
    }

    #[tokio::test]
    async fn test_reload_clears_halt() {
        let mut h = harness(settings());
        h.controller
            .emergency_shutdown(&ControlError::SafetyViolationRepeated {
                dimension: "cpu".to_string(),
                cycles: 3,
            })
            .await;
        assert!(h.controller.is_halted());

        h.controller.reload(Arc::new(settings())).await;
        assert!(!h.controller.is_halted());
    }

    #[tokio::test]
    async fn test_shutdown_resets_state() {
        let mut s = settings();
        s.bandwidth_target_mbps = 100.0;
        let mut h = harness(s);
        h.samples.send_replace(measured(30.0, 0.0));
        h.controller.run_cycle().await.unwrap();
        assert!(!h.store.load().unwrap().state.is_idle());

        h.controller.shutdown().await;

        // 1 cpu + 3 downloaders
        assert_eq!(h.actuator.stops.load(Ordering::SeqCst), 4);
        assert!(h.store.load().unwrap().state.is_idle());
        assert_eq!(h.controller.phase(Dimension::Cpu), ActuatorPhase::Idle);
        assert_eq!(
            h.controller.phase(Dimension::Bandwidth),
            ActuatorPhase::Idle
        );
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown_command() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let actuator = Arc::new(MockActuator::default());
        let (_samples, sample_rx) = watch::channel(RateSample::default());
        let (controller, commands) =
            Controller::new(Arc::new(settings()), actuator, store.clone(), sample_rx);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(controller.run(shutdown_rx));
        commands.send(ControlCommand::Shutdown).await.unwrap();
        task.await.unwrap();

        assert!(store.load().unwrap().version >= 1);
    }
}
