use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::data::{sort_from_key, FeedFilters, FeedSort};
use crate::feed::ViewOptions;
use crate::playback::PlaybackConfig;
use crate::size_cache::Estimator;

const DEFAULT_ENV_PREFIX: &str = "SPACEFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn view_options(&self) -> ViewOptions {
        ViewOptions {
            page_size: self.feed.page_size.max(1),
            fetch_threshold: self.feed.fetch_threshold,
            overscan: self.feed.overscan,
            estimator: Estimator {
                base_row_height: self.layout.base_row_height,
                media_extra_height: self.layout.media_extra_height,
                reply_row_height: self.layout.reply_row_height,
            },
            playback: PlaybackConfig {
                skip_seconds: self.player.skip_seconds,
                controls_idle_timeout: self.player.controls_idle_timeout,
            },
            exclusive_playback: self.player.exclusive,
        }
    }

    pub fn initial_filters(&self) -> FeedFilters {
        FeedFilters {
            space: self.feed.space.clone().filter(|space| !space.trim().is_empty()),
            sort: self.feed.sort,
            bookmarked_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_fetch_threshold")]
    pub fetch_threshold: usize,
    #[serde(default = "default_overscan")]
    pub overscan: usize,
    #[serde(default)]
    pub sort: FeedSort,
    #[serde(default)]
    pub space: Option<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            fetch_threshold: default_fetch_threshold(),
            overscan: default_overscan(),
            sort: FeedSort::default(),
            space: None,
        }
    }
}

fn default_page_size() -> usize {
    10
}

fn default_fetch_threshold() -> usize {
    3
}

fn default_overscan() -> usize {
    2
}

/// Row height estimates used before a row is measured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayoutConfig {
    #[serde(default = "default_base_row_height")]
    pub base_row_height: f64,
    #[serde(default = "default_media_extra_height")]
    pub media_extra_height: f64,
    #[serde(default = "default_reply_row_height")]
    pub reply_row_height: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            base_row_height: default_base_row_height(),
            media_extra_height: default_media_extra_height(),
            reply_row_height: default_reply_row_height(),
        }
    }
}

fn default_base_row_height() -> f64 {
    140.0
}

fn default_media_extra_height() -> f64 {
    320.0
}

fn default_reply_row_height() -> f64 {
    120.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    #[serde(default = "default_mpv_path")]
    pub mpv_path: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_skip_seconds")]
    pub skip_seconds: f64,
    #[serde(default = "default_controls_idle_timeout", with = "humantime_serde")]
    pub controls_idle_timeout: Duration,
    /// Pause the playing item when another one starts.
    #[serde(default)]
    pub exclusive: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            mpv_path: default_mpv_path(),
            extra_args: Vec::new(),
            skip_seconds: default_skip_seconds(),
            controls_idle_timeout: default_controls_idle_timeout(),
            exclusive: false,
        }
    }
}

fn default_mpv_path() -> String {
    "mpv".into()
}

fn default_skip_seconds() -> f64 {
    10.0
}

fn default_controls_idle_timeout() -> Duration {
    Duration::from_secs(3)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default = "default_latency", with = "humantime_serde")]
    pub latency: Duration,
    #[serde(default)]
    pub fail_mutations: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            fixture_path: None,
            latency: default_latency(),
            fail_mutations: false,
        }
    }
}

fn default_latency() -> Duration {
    Duration::from_millis(150)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            filter: default_log_filter(),
        }
    }
}

pub fn default_log_filter() -> String {
    "spacefeed=info".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

/// Defaults, then the YAML file, then `<PREFIX>_<SECTION>__<KEY>` environment overrides.
pub fn load(options: LoadOptions) -> Result<Config> {
    let path = options.config_file.clone().or_else(default_config_path);
    let mut cfg = match path {
        Some(path) if path.exists() => read_config_file(&path)?,
        _ => Config::default(),
    };

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    for (key, value) in load_env(prefix) {
        apply_env_value(&mut cfg, &key, value);
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    if data.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn load_env(prefix: &str) -> Vec<(String, String)> {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    let mut pairs: Vec<(String, String)> = env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(&upper_prefix)
                .map(|stripped| (stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect();
    pairs.sort();
    pairs
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "feed.page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.page_size = parsed;
            }
        }
        "feed.fetch_threshold" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.fetch_threshold = parsed;
            }
        }
        "feed.overscan" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.overscan = parsed;
            }
        }
        "feed.sort" => cfg.feed.sort = sort_from_key(&value),
        "feed.space" => cfg.feed.space = Some(value),
        "layout.base_row_height" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.layout.base_row_height = parsed;
            }
        }
        "layout.media_extra_height" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.layout.media_extra_height = parsed;
            }
        }
        "layout.reply_row_height" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.layout.reply_row_height = parsed;
            }
        }
        "player.mpv_path" => cfg.player.mpv_path = value,
        "player.extra_args" => {
            cfg.player.extra_args = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "player.skip_seconds" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.player.skip_seconds = parsed;
            }
        }
        "player.controls_idle_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.player.controls_idle_timeout = duration;
            }
        }
        "player.exclusive" => cfg.player.exclusive = parse_flag(&value),
        "backend.fixture_path" => cfg.backend.fixture_path = Some(PathBuf::from(value)),
        "backend.latency" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.backend.latency = duration;
            }
        }
        "backend.fail_mutations" => cfg.backend.fail_mutations = parse_flag(&value),
        "log.file" => cfg.log.file = Some(PathBuf::from(value)),
        "log.filter" => cfg.log.filter = value,
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("spacefeed").join("config.yaml"))
}

pub fn save(path: Option<PathBuf>, cfg: &Config) -> Result<PathBuf> {
    let path = if let Some(path) = path {
        path
    } else {
        default_config_path().context("config: unable to determine default config path")?
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(cfg).context("config: failed to serialize config")?;
    fs::write(&path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;

    Ok(path)
}
