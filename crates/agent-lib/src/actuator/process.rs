//! Process-backed actuators
//!
//! Each generator runs in its own process group so that stopping it also
//! reaches any descendants (the `sh` download loop spawns `curl`).

use super::{Actuator, ActuatorHandle};
use crate::error::{ControlError, ControlResult};
use crate::models::{BandwidthCommand, CpuCommand, Dimension};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Download loop run under `sh -c`; `$0` is the download tool
const DOWNLOAD_LOOP: &str = r#"while :; do "$0" "$@" || sleep 1; done"#;

/// Configuration for process-backed actuators
#[derive(Debug, Clone)]
pub struct ProcessActuatorConfig {
    /// CPU load generator (stress-ng compatible flags)
    pub cpu_tool: String,
    /// Download tool (curl compatible flags)
    pub download_tool: String,
    /// Shell used for the download loop
    pub shell: String,
    /// Time between SIGTERM and SIGKILL when stopping
    pub stop_grace_period: Duration,
}

impl Default for ProcessActuatorConfig {
    fn default() -> Self {
        Self {
            cpu_tool: "stress-ng".to_string(),
            download_tool: "curl".to_string(),
            shell: "sh".to_string(),
            stop_grace_period: Duration::from_secs(5),
        }
    }
}

/// Actuator spawning external load-generation processes
pub struct ProcessActuator {
    config: ProcessActuatorConfig,
    children: Mutex<HashMap<u64, Child>>,
    next_id: AtomicU64,
}

impl ProcessActuator {
    pub fn new(config: ProcessActuatorConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

}

impl Default for ProcessActuator {
    fn default() -> Self {
        Self::new(ProcessActuatorConfig::default())
    }
}

impl ProcessActuator {
    /// Arguments passed to the CPU tool for `command`
    pub fn cpu_args(command: &CpuCommand) -> Vec<String> {
        vec![
            "--cpu".to_string(),
            command.workers.to_string(),
            "--cpu-load".to_string(),
            command.load_percent.to_string(),
            "--timeout".to_string(),
            "0".to_string(),
        ]
    }

    /// Arguments passed to the download tool for one downloader
    pub fn download_args(command: &BandwidthCommand, url: &Url) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            "-o".to_string(),
            "/dev/null".to_string(),
        ];
        if let Some(bytes_per_sec) = limit_rate_bytes(command.rate_mbps_per_downloader) {
            args.push("--limit-rate".to_string());
            args.push(bytes_per_sec.to_string());
        }
        args.push(url.to_string());
        args
    }

    /// Number of generators currently tracked
    pub async fn running(&self) -> usize {
        self.children.lock().await.len()
    }

    fn resolve_tool(tool: &str) -> ControlResult<PathBuf> {
        find_on_path(tool).ok_or_else(|| ControlError::ActuatorUnavailable {
            tool: tool.to_string(),
        })
    }

    async fn spawn(
        &self,
        dimension: Dimension,
        program: &Path,
        args: &[String],
    ) -> ControlResult<ActuatorHandle> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ControlError::ActuatorFailed(format!("failed to spawn {}: {e}", program.display()))
            })?;

        let handle = ActuatorHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            dimension,
            pid: child.id(),
        };
        debug!(
            dimension = %dimension,
            pid = ?handle.pid,
            program = %program.display(),
            "Spawned load generator"
        );

        self.children.lock().await.insert(handle.id, child);
        Ok(handle)
    }

    /// SIGTERM every group, share one grace period, then SIGKILL leftovers
    async fn stop_handles(&self, handles: Vec<ActuatorHandle>) -> ControlResult<()> {
        let mut stopping = Vec::with_capacity(handles.len());
        {
            let mut children = self.children.lock().await;
            for handle in handles {
                match children.remove(&handle.id) {
                    // `id()` is gone once the child has been reaped
                    Some(child) => stopping.push((child.id(), child)),
                    None => debug!(id = handle.id, "Stop requested for unknown generator"),
                }
            }
        }

        let mut first_error = None;
        for pid in stopping.iter().filter_map(|(pid, _)| *pid) {
            if let Err(e) = signal_group(pid, libc::SIGTERM) {
                first_error.get_or_insert(e);
            }
        }

        let deadline = Instant::now() + self.config.stop_grace_period;
        for (pid, child) in &mut stopping {
            match timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(pid = ?pid, status = %status, "Load generator exited");
                }
                Ok(Err(e)) => {
                    warn!(pid = ?pid, error = %e, "Failed waiting for load generator");
                }
                Err(_) => {
                    warn!(
                        pid = ?pid,
                        grace_ms = self.config.stop_grace_period.as_millis() as u64,
                        "Load generator ignored SIGTERM, killing"
                    );
                    if let Err(e) = child.start_kill() {
                        debug!(pid = ?pid, error = %e, "Kill after grace period failed");
                    }
                    if let Err(e) = child.wait().await {
                        warn!(pid = ?pid, error = %e, "Failed reaping killed load generator");
                    }
                }
            }
        }

        // Descendants may outlive the group leader
        for pid in stopping.iter().filter_map(|(pid, _)| *pid) {
            if let Err(e) = signal_group(pid, libc::SIGKILL) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Actuator for ProcessActuator {
    async fn start_cpu(&self, command: &CpuCommand) -> ControlResult<ActuatorHandle> {
        if command.is_off() {
            return Err(ControlError::ActuatorFailed(
                "refusing to start zero CPU workers".to_string(),
            ));
        }
        let program = Self::resolve_tool(&self.config.cpu_tool)?;
        let handle = self
            .spawn(Dimension::Cpu, &program, &Self::cpu_args(command))
            .await?;

        info!(
            workers = command.workers,
            load_percent = command.load_percent,
            pid = ?handle.pid,
            "Started CPU load generator"
        );
        Ok(handle)
    }

    async fn stop_cpu(&self, handle: ActuatorHandle) -> ControlResult<()> {
        self.stop_handles(vec![handle]).await
    }

    async fn start_bandwidth(
        &self,
        command: &BandwidthCommand,
        url_pool: &[Url],
    ) -> ControlResult<Vec<ActuatorHandle>> {
        if command.is_off() {
            return Ok(Vec::new());
        }
        if url_pool.is_empty() {
            return Err(ControlError::ActuatorFailed(
                "download URL pool is empty".to_string(),
            ));
        }

        let shell = Self::resolve_tool(&self.config.shell)?;
        let tool = Self::resolve_tool(&self.config.download_tool)?;

        let mut handles = Vec::with_capacity(command.downloaders as usize);
        for index in 0..command.downloaders as usize {
            let url = &url_pool[index % url_pool.len()];

            let mut args = vec![
                "-c".to_string(),
                DOWNLOAD_LOOP.to_string(),
                tool.to_string_lossy().into_owned(),
            ];
            args.extend(Self::download_args(command, url));

            match self.spawn(Dimension::Bandwidth, &shell, &args).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(error = %e, started = handles.len(), "Downloader start failed, rolling back");
                    if let Err(stop_err) = self.stop_handles(handles).await {
                        warn!(error = %stop_err, "Rollback of started downloaders failed");
                    }
                    return Err(e);
                }
            }
        }

        info!(
            downloaders = command.downloaders,
            rate_mbps_per_downloader = command.rate_mbps_per_downloader,
            mode = %command.mode(),
            "Started bandwidth load generators"
        );
        Ok(handles)
    }

    async fn stop_bandwidth(&self, handles: Vec<ActuatorHandle>) -> ControlResult<()> {
        self.stop_handles(handles).await
    }

    async fn is_alive(&self, handle: &ActuatorHandle) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(&handle.id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn kill_all(&self) {
        let drained: Vec<(u64, Child)> = self.children.lock().await.drain().collect();
        for (_, mut child) in drained {
            if let Some(pid) = child.id() {
                let _ = signal_group(pid, libc::SIGKILL);
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// curl `--limit-rate` value in bytes per second; `None` means unlimited
pub(crate) fn limit_rate_bytes(rate_mbps: f64) -> Option<u64> {
    if rate_mbps <= 0.0 || !rate_mbps.is_finite() {
        return None;
    }
    Some(((rate_mbps * 1_000_000.0 / 8.0).round() as u64).max(1))
}

/// Locate an executable by name on PATH, or accept an explicit path
pub fn find_on_path(tool: &str) -> Option<PathBuf> {
    let is_executable = |path: &Path| {
        std::fs::metadata(path)
            .map(|m| m.is_file())
            .unwrap_or(false)
    };

    if tool.contains('/') {
        let path = PathBuf::from(tool);
        return is_executable(&path).then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

/// Send `signal` to the process group led by `pgid`
fn signal_group(pgid: u32, signal: libc::c_int) -> ControlResult<()> {
    let Ok(pgid) = i32::try_from(pgid) else {
        return Err(ControlError::ActuatorFailed(format!("pid {pgid} out of range")));
    };
    // SAFETY: kill(2) with a negative pid only signals that process group
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(ControlError::ActuatorFailed(format!(
        "failed to signal process group {pgid}: {err}"
    )))
}
