//! Shared synthetic-load state record
//!
//! The commanded synthetic load is the only mutable state shared between
//! the sampling, control and reporting cycles, which may live in separate
//! processes. It is kept in a small JSON file:
//! - writes go to a per-process temp file, are fsynced, then renamed over
//!   the record so readers never observe a partial write
//! - every commit bumps a monotonically increasing version
//! - a missing record reads as the all-zero state

use crate::error::{ControlError, ControlResult};
use crate::models::SyntheticLoadState;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// A versioned read of the shared record
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u64,
    /// Unix seconds of the commit
    pub updated_at: i64,
    #[serde(flatten)]
    pub state: SyntheticLoadState,
}

/// File-backed store for [`SyntheticLoadState`]
pub struct StateStore {
    path: PathBuf,
    /// Serializes writers within this process
    write_lock: Mutex<()>,
    last_version: AtomicU64,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            last_version: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fetch the latest committed snapshot
    pub fn load(&self) -> ControlResult<StateSnapshot> {
        read_snapshot(&self.path)
    }

    /// Persist a new state, returning the committed snapshot
    pub fn commit(&self, state: &SyntheticLoadState) -> ControlResult<StateSnapshot> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| ControlError::StateStore("state write lock poisoned".to_string()))?;

        let on_disk = read_snapshot(&self.path).map(|s| s.version).unwrap_or(0);
        let version = on_disk.max(self.last_version.load(Ordering::SeqCst)) + 1;

        let snapshot = StateSnapshot {
            version,
            updated_at: chrono::Utc::now().timestamp(),
            state: *state,
        };
        self.write_atomic(&snapshot)?;
        self.last_version.store(version, Ordering::SeqCst);

        debug!(
            path = %self.path.display(),
            version = version,
            cpu_percent = state.cpu_percent,
            bw_total_mbps = state.bw_total_mbps,
            "Committed synthetic load state"
        );
        Ok(snapshot)
    }

    /// Commit the all-zero state
    pub fn reset(&self) -> ControlResult<StateSnapshot> {
        self.commit(&SyntheticLoadState::default())
    }

    fn write_atomic(&self, snapshot: &StateSnapshot) -> ControlResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ControlError::StateStore(format!(
                        "failed to create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let json = serde_json::to_vec_pretty(snapshot)?;

        let temp_path = self
            .path
            .with_extension(format!("tmp.{}", std::process::id()));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| {
                ControlError::StateStore(format!(
                    "failed to create temp file {}: {e}",
                    temp_path.display()
                ))
            })?;

        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| ControlError::StateStore(format!("failed to write state: {e}")))?;

        fs::rename(&temp_path, &self.path).map_err(|e| {
            ControlError::StateStore(format!(
                "failed to rename {} to {}: {e}",
                temp_path.display(),
                self.path.display()
            ))
        })
    }
}

/// Read a state record from disk; a missing file is the zero state
pub fn read_snapshot(path: &Path) -> ControlResult<StateSnapshot> {
    match fs::read(path) {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(StateSnapshot::default()),
        Err(e) => Err(ControlError::StateStore(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}
