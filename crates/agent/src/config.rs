//! Agent configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `LOADPILOT_*` environment variables.

use anyhow::{Context, Result};
use loadpilot_lib::LoadSettings;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Environment variable prefix for every setting
pub const ENV_PREFIX: &str = "LOADPILOT";

/// Load and validate settings
pub fn load(path: Option<&Path>) -> Result<LoadSettings> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("download_url_pool"),
    );

    let settings: LoadSettings = builder
        .build()
        .context("failed to read configuration sources")?
        .try_deserialize()
        .context("failed to parse configuration")?;

    settings.validate().context("invalid configuration")?;
    Ok(settings)
}

/// Signal `tx` whenever the config file is written or replaced
///
/// The parent directory is watched because editors often save by renaming
/// a new file over the old one. The returned watcher must be kept alive.
pub fn watch(path: &Path, tx: mpsc::UnboundedSender<()>) -> Result<RecommendedWatcher> {
    let file_name = path.file_name().map(|name| name.to_os_string());
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let touches_config = event
                .paths
                .iter()
                .any(|p| p.file_name() == file_name.as_deref());
            if touches_config && (event.kind.is_modify() || event.kind.is_create()) {
                debug!(kind = ?event.kind, "Config file changed");
                let _ = tx.send(());
            }
        }
        Err(e) => warn!(error = %e, "Config watcher error"),
    })
    .context("failed to create config watcher")?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    Ok(watcher)
}
