use std::env;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::{default_log_filter, LogConfig};

pub const FILTER_ENV: &str = "SPACEFEED_LOG";
pub const FILE_ENV: &str = "SPACEFEED_LOG_FILE";

/// Log file from the environment or the config, if any. The terminal owns stdout, so
/// nothing is logged without one.
pub fn log_file(cfg: &LogConfig) -> Option<PathBuf> {
    env::var_os(FILE_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| cfg.file.clone())
}

fn filter(cfg: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(&cfg.filter))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Installs the global subscriber. Returns the file being written, or `None` when
/// logging is off.
pub fn init(cfg: &LogConfig) -> Result<Option<PathBuf>> {
    let Some(path) = log_file(cfg) else {
        return Ok(None);
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("log: failed to create directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("log: failed to open {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter(cfg))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!("log: failed to install subscriber: {err}"))?;

    tracing::info!(version = crate::VERSION, "logging started");
    Ok(Some(path))
}
