use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config;
use crate::data::DemoBackend;
use crate::dispatch::ThreadSpawner;
use crate::feed::Services;
use crate::logging;
use crate::ui;
use crate::video::{MpvFactory, MpvOptions};

/// Overrides taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_file: Option<PathBuf>,
    pub fixture: Option<PathBuf>,
    pub fail_mutations: bool,
}

pub fn run(opts: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: opts.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    let log_path = logging::init(&cfg.log).context("init logging")?;

    let fixture = opts.fixture.or_else(|| cfg.backend.fixture_path.clone());
    let backend = match &fixture {
        Some(path) => DemoBackend::from_fixture(path)
            .with_context(|| format!("load fixture {}", path.display()))?,
        None => DemoBackend::seeded(),
    }
    .with_latency(cfg.backend.latency);
    backend.set_fail_mutations(opts.fail_mutations || cfg.backend.fail_mutations);
    info!(
        posts = backend.post_count(),
        fixture = ?fixture,
        latency_ms = cfg.backend.latency.as_millis() as u64,
        "backend ready"
    );

    let services = Services::from_backend(Arc::new(backend), Arc::new(ThreadSpawner));
    let elements = MpvFactory::new(MpvOptions {
        mpv_path: cfg.player.mpv_path.clone(),
        extra_args: cfg.player.extra_args.clone(),
    });

    let mut status = "Browsing spacefeed. j/k to move, c for comments, p to play media, q to quit."
        .to_string();
    if let Some(path) = log_path {
        status.push_str(&format!(" Logging to {}.", friendly_path(&path)));
    }

    let options = ui::Options {
        services,
        view: cfg.view_options(),
        filters: cfg.initial_filters(),
        elements: Box::new(elements),
        status_message: status,
    };

    let mut model = ui::Model::new(options);
    model.run()?;
    info!("session ended");
    Ok(())
}

fn friendly_path(path: &std::path::Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home) {
            let mut display = String::from("~");
            if !stripped.as_os_str().is_empty() {
                display.push_str(&format!("/{}", stripped.display()));
            }
            return display;
        }
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn friendly_path_shortens_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let path = home.join(".config/spacefeed/config.yaml");
        assert_eq!(friendly_path(&path), "~/.config/spacefeed/config.yaml");
        assert_eq!(friendly_path(std::path::Path::new("/tmp/x.log")), "/tmp/x.log");
    }
}
