use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tracing::{debug, warn};

#[cfg(unix)]
use rand::{distributions::Alphanumeric, Rng};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use crate::error::PlaybackError;
use crate::feed::MediaElementFactory;
use crate::model::{MediaAttachment, MediaKind};
use crate::playback::{ElementSample, FullscreenApi, MediaElement, Sampler};

const IPC_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpvOptions {
    pub mpv_path: String,
    pub extra_args: Vec<String>,
}

impl Default for MpvOptions {
    fn default() -> Self {
        Self {
            mpv_path: "mpv".into(),
            extra_args: Vec::new(),
        }
    }
}

/// Creates one [`MpvElement`] per media item.
#[derive(Debug, Clone, Default)]
pub struct MpvFactory {
    options: MpvOptions,
}

impl MpvFactory {
    pub fn new(options: MpvOptions) -> Self {
        Self { options }
    }
}

impl MediaElementFactory for MpvFactory {
    fn create(&self, media: &MediaAttachment) -> Box<dyn MediaElement> {
        Box::new(MpvElement::new(media, self.options.clone()))
    }
}

/// A running mpv process plus its IPC endpoint. Dropping it stops playback.
struct MpvSession {
    child: Child,
    ipc_path: Option<String>,
}

impl MpvSession {
    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn send(&self, command: Value) -> Result<()> {
        let Some(path) = &self.ipc_path else {
            return Err(anyhow!("mpv controls are not supported on this platform"));
        };
        send_ipc_command(path, &command)
    }
}

impl Drop for MpvSession {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(path) = &self.ipc_path {
            cleanup_ipc_path(path);
        }
    }
}

/// Plays a media item in an mpv window driven over mpv's JSON IPC. The process is only
/// launched on the first `play`; until then commands are remembered as launch flags.
pub struct MpvElement {
    options: MpvOptions,
    playback_url: String,
    label: String,
    use_ytdl: bool,
    muted: bool,
    fullscreen: bool,
    start_at: f64,
    session: Option<MpvSession>,
}

impl MpvElement {
    pub fn new(media: &MediaAttachment, options: MpvOptions) -> Self {
        Self {
            options,
            playback_url: media.playback_url(),
            label: media.label(),
            use_ytdl: matches!(media.kind, MediaKind::Embed { .. }),
            muted: true,
            fullscreen: false,
            start_at: 0.0,
            session: None,
        }
    }

    fn launch_args(&self, ipc_path: Option<&str>) -> Vec<String> {
        let mut args = vec![
            self.playback_url.clone(),
            "--force-window=yes".to_string(),
            "--keep-open=no".to_string(),
            "--really-quiet".to_string(),
            "--terminal=no".to_string(),
            "--input-terminal=no".to_string(),
            format!("--ytdl={}", if self.use_ytdl { "yes" } else { "no" }),
            format!("--mute={}", if self.muted { "yes" } else { "no" }),
        ];
        if self.fullscreen {
            args.push("--fullscreen".to_string());
        }
        if self.start_at > 0.0 {
            args.push(format!("--start={}", self.start_at));
        }
        if !self.label.is_empty() {
            args.push(format!("--force-media-title={}", self.label));
        }
        if let Some(path) = ipc_path {
            args.push(format!("--input-ipc-server={path}"));
        }
        args.extend(self.options.extra_args.iter().cloned());
        args
    }

    fn launch(&mut self) -> Result<()> {
        if self.playback_url.trim().is_empty() {
            return Err(anyhow!("video URL missing"));
        }
        let ipc_path = unique_ipc_path();
        if let Some(path) = &ipc_path {
            cleanup_ipc_path(path);
        }
        let args = self.launch_args(ipc_path.as_deref());
        debug!(mpv = %self.options.mpv_path, ?args, "launching mpv");

        let child = Command::new(&self.options.mpv_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("launch mpv to play {}", self.playback_url))?;
        self.session = Some(MpvSession { child, ipc_path });
        Ok(())
    }

    /// Sends to the running session; without one the command only updates launch flags.
    fn command(&mut self, command: Value) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.has_exited() {
            self.session = None;
            return;
        }
        if let Err(err) = session.send(command) {
            warn!(error = %err, "mpv command failed");
        }
    }
}

impl MediaElement for MpvElement {
    fn play(&mut self) -> Result<(), PlaybackError> {
        if let Some(session) = self.session.as_mut() {
            if !session.has_exited() {
                self.command(json!(["set_property", "pause", false]));
                return Ok(());
            }
            self.session = None;
        }
        self.launch()
            .map_err(|err| PlaybackError::LoadFailed(format!("{err:#}")))
    }

    fn pause(&mut self) {
        self.command(json!(["set_property", "pause", true]));
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.command(json!(["set_property", "mute", muted]));
    }

    fn seek(&mut self, seconds: f64) {
        self.start_at = seconds.max(0.0);
        self.command(json!(["seek", seconds, "absolute"]));
    }

    fn request_fullscreen(&mut self, api: FullscreenApi, enter: bool) -> bool {
        if api != FullscreenApi::Standard {
            return false;
        }
        self.fullscreen = enter;
        self.command(json!(["set_property", "fullscreen", enter]));
        true
    }

    fn release(&mut self) {
        if self.session.take().is_some() {
            debug!(url = %self.playback_url, "mpv session stopped");
        }
    }

    fn sampler(&mut self) -> Option<Sampler> {
        let session = self.session.as_mut()?;
        if session.has_exited() {
            self.session = None;
            self.start_at = 0.0;
            return Some(Box::new(|| ElementSample {
                ended: true,
                ..ElementSample::default()
            }));
        }
        let path = session.ipc_path.clone()?;
        Some(Box::new(move || ElementSample {
            position: query_f64(&path, "time-pos"),
            duration: query_f64(&path, "duration"),
            ended: false,
        }))
    }

    fn observe(&mut self, sample: &ElementSample) {
        if let Some(position) = sample.position {
            self.start_at = position;
        }
    }
}

fn query_f64(path: &str, property: &str) -> Option<f64> {
    query_ipc_property(path, property)
        .ok()
        .and_then(|value| value.as_f64())
}

fn send_ipc_command(path: &str, command: &Value) -> Result<()> {
    let payload = json!({ "command": command });
    let serialized = serde_json::to_string(&payload).context("serialize mpv command")?;
    send_ipc_command_inner(path, &serialized)
}

#[cfg(unix)]
fn send_ipc_command_inner(path: &str, serialized: &str) -> Result<()> {
    let mut stream =
        UnixStream::connect(path).with_context(|| format!("connect to mpv IPC socket {path}"))?;
    stream
        .write_all(serialized.as_bytes())
        .context("write mpv IPC command")?;
    stream
        .write_all(b"\n")
        .context("write mpv IPC command terminator")?;
    Ok(())
}

#[cfg(not(unix))]
fn send_ipc_command_inner(_path: &str, _serialized: &str) -> Result<()> {
    Err(anyhow!("mpv controls are not supported on this platform"))
}

#[cfg(unix)]
fn query_ipc_property(path: &str, property: &str) -> Result<Value> {
    const REQUEST_ID: u64 = 7;
    let payload = json!({ "command": ["get_property", property], "request_id": REQUEST_ID });
    let serialized = serde_json::to_string(&payload).context("serialize mpv query")?;
    let mut stream =
        UnixStream::connect(path).with_context(|| format!("connect to mpv IPC socket {path}"))?;
    stream
        .set_read_timeout(Some(IPC_TIMEOUT))
        .context("configure mpv IPC socket")?;
    stream
        .write_all(serialized.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .context("write mpv IPC query")?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line.context("read mpv IPC reply")?;
        if let Some(data) = reply_data(&line, REQUEST_ID) {
            return data;
        }
    }
    Err(anyhow!("mpv closed the IPC socket before replying"))
}

#[cfg(not(unix))]
fn query_ipc_property(_path: &str, _property: &str) -> Result<Value> {
    Err(anyhow!("mpv controls are not supported on this platform"))
}

/// Picks the reply for `request_id` out of mpv's event stream.
fn reply_data(line: &str, request_id: u64) -> Option<Result<Value>> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("request_id").and_then(Value::as_u64) != Some(request_id) {
        return None;
    }
    match value.get("error").and_then(Value::as_str) {
        Some("success") => Some(Ok(value.get("data").cloned().unwrap_or(Value::Null))),
        Some(other) => Some(Err(anyhow!("mpv: {other}"))),
        None => Some(Err(anyhow!("mpv reply without status"))),
    }
}

#[cfg(unix)]
fn unique_ipc_path() -> Option<String> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let mut path = std::env::temp_dir();
    path.push(format!("spacefeed-mpv-{}-{suffix}.sock", std::process::id()));
    Some(path.to_string_lossy().to_string())
}

#[cfg(not(unix))]
fn unique_ipc_path() -> Option<String> {
    None
}

fn cleanup_ipc_path(path: &str) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!(path, error = %err, "failed to remove mpv ipc path");
        }
    }
}
