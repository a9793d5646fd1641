use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PlaybackError;
use crate::model::MediaAttachment;

/// Fullscreen entry points, tried in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FullscreenApi {
    Standard,
    Webkit,
    Moz,
    Ms,
}

impl FullscreenApi {
    pub const PRIORITY: [FullscreenApi; 4] = [
        FullscreenApi::Standard,
        FullscreenApi::Webkit,
        FullscreenApi::Moz,
        FullscreenApi::Ms,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullscreenSupport {
    Supported(FullscreenApi),
    Unsupported,
}

/// Progress reported back by an element that plays out of process.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ElementSample {
    pub position: Option<f64>,
    pub duration: Option<f64>,
    pub ended: bool,
}

/// A progress query detached from its element so it can run off the UI thread.
pub type Sampler = Box<dyn FnOnce() -> ElementSample + Send>;

/// The player surface a controller drives. Exactly one controller owns an element.
pub trait MediaElement {
    fn play(&mut self) -> Result<(), PlaybackError>;
    fn pause(&mut self);
    fn set_muted(&mut self, muted: bool);
    fn seek(&mut self, seconds: f64);
    /// Returns `false` when this element does not expose `api`.
    fn request_fullscreen(&mut self, api: FullscreenApi, enter: bool) -> bool;
    fn release(&mut self) {}
    /// A progress query for elements that do not push events on their own. It may
    /// block, so hosts run it on a worker and hand the result to `apply_sample`.
    fn sampler(&mut self) -> Option<Sampler> {
        None
    }
    /// Sees every sample applied to its controller.
    fn observe(&mut self, _sample: &ElementSample) {}
}

/// An element with no output. Used where nothing is rendered, e.g. headless runs.
#[derive(Debug, Clone, Default)]
pub struct HeadlessElement {
    pub playing: bool,
    pub muted: bool,
    pub position: f64,
    pub fullscreen: Option<FullscreenApi>,
}

impl MediaElement for HeadlessElement {
    fn play(&mut self) -> Result<(), PlaybackError> {
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn seek(&mut self, seconds: f64) {
        self.position = seconds;
    }

    fn request_fullscreen(&mut self, api: FullscreenApi, enter: bool) -> bool {
        if api != FullscreenApi::Standard {
            return false;
        }
        self.fullscreen = enter.then_some(api);
        true
    }

    fn release(&mut self) {
        self.playing = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    pub skip_seconds: f64,
    #[serde(with = "humantime_serde")]
    pub controls_idle_timeout: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            skip_seconds: 10.0,
            controls_idle_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Poster,
    Playing,
    Paused,
    /// Pointer held on the progress bar; `resume_playing` is the state to return to.
    Scrubbing { resume_playing: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    pub current_time: f64,
    pub duration: f64,
    pub muted: bool,
    pub is_fullscreen: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Poster,
            current_time: 0.0,
            duration: 0.0,
            muted: true,
            is_fullscreen: false,
        }
    }
}

/// A deadline owned by the controller. Dropping or replacing it cancels it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTask {
    pub deadline: Instant,
}

impl ScheduledTask {
    pub fn after(now: Instant, delay: Duration) -> Self {
        Self {
            deadline: now + delay,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

pub struct MediaPlaybackController {
    media_id: String,
    element: Option<Box<dyn MediaElement>>,
    state: PlaybackState,
    config: PlaybackConfig,
    overlay_visible: bool,
    hide_task: Option<ScheduledTask>,
    fullscreen_api: Option<FullscreenApi>,
    failure: Option<PlaybackError>,
    sampling: bool,
}

impl std::fmt::Debug for MediaPlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPlaybackController")
            .field("media_id", &self.media_id)
            .field("mounted", &self.element.is_some())
            .field("state", &self.state)
            .field("overlay_visible", &self.overlay_visible)
            .field("hide_task", &self.hide_task)
            .field("failure", &self.failure)
            .finish()
    }
}

impl MediaPlaybackController {
    pub fn new(
        media: &MediaAttachment,
        element: Box<dyn MediaElement>,
        config: PlaybackConfig,
    ) -> Self {
        let failure = if media.url.trim().is_empty() {
            Some(PlaybackError::MissingSource(media.id.clone()))
        } else if !media.kind.is_playable() {
            Some(PlaybackError::Unplayable(media.id.clone()))
        } else {
            None
        };
        Self {
            media_id: media.id.clone(),
            element: Some(element),
            state: PlaybackState::default(),
            config,
            overlay_visible: true,
            hide_task: None,
            fullscreen_api: None,
            failure,
            sampling: false,
        }
    }

    pub fn media_id(&self) -> &str {
        &self.media_id
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn status(&self) -> PlaybackStatus {
        self.state.status
    }

    pub fn overlay_visible(&self) -> bool {
        self.overlay_visible
    }

    pub fn hide_task(&self) -> Option<ScheduledTask> {
        self.hide_task
    }

    pub fn is_mounted(&self) -> bool {
        self.element.is_some()
    }

    pub fn is_unplayable(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure(&self) -> Option<&PlaybackError> {
        self.failure.as_ref()
    }

    pub fn can_scrub(&self) -> bool {
        self.state.duration > 0.0
            && matches!(
                self.state.status,
                PlaybackStatus::Playing | PlaybackStatus::Paused
            )
    }

    pub fn progress(&self) -> f64 {
        if self.state.duration > 0.0 {
            (self.state.current_time / self.state.duration).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Element to command, or `None` once unmounted or unplayable.
    fn live(&mut self) -> Option<&mut Box<dyn MediaElement>> {
        if self.failure.is_some() {
            return None;
        }
        self.element.as_mut()
    }

    /// Leaves the poster: unmutes and starts playback.
    pub fn tap_play(&mut self, now: Instant) -> Result<(), PlaybackError> {
        if !matches!(
            self.state.status,
            PlaybackStatus::Poster | PlaybackStatus::Paused
        ) {
            return Ok(());
        }
        let from_poster = self.state.status == PlaybackStatus::Poster;
        let Some(element) = self.live() else {
            return Ok(());
        };
        if from_poster {
            element.set_muted(false);
        }
        if let Err(err) = element.play() {
            return Err(self.fail(err));
        }
        if from_poster {
            self.state.muted = false;
        }
        self.state.status = PlaybackStatus::Playing;
        debug!(media = %self.media_id, "playing");
        self.show_controls(now);
        Ok(())
    }

    /// Tap on the video surface: toggles play/pause, or starts from the poster.
    pub fn tap(&mut self, now: Instant) -> Result<(), PlaybackError> {
        match self.state.status {
            PlaybackStatus::Poster | PlaybackStatus::Paused => self.tap_play(now),
            PlaybackStatus::Playing => {
                if let Some(element) = self.live() {
                    element.pause();
                    self.state.status = PlaybackStatus::Paused;
                    self.show_controls(now);
                }
                Ok(())
            }
            PlaybackStatus::Scrubbing { .. } => Ok(()),
        }
    }

    /// Starts scrubbing at `position` seconds. Ignored while the duration is unknown.
    pub fn pointer_down(&mut self, position: f64) -> bool {
        if self.live().is_none() || !self.can_scrub() {
            return false;
        }
        let resume_playing = self.state.status == PlaybackStatus::Playing;
        self.state.status = PlaybackStatus::Scrubbing { resume_playing };
        self.state.current_time = self.clamp_time(position);
        self.overlay_visible = true;
        self.hide_task = None;
        true
    }

    pub fn pointer_move(&mut self, position: f64) -> bool {
        if !matches!(self.state.status, PlaybackStatus::Scrubbing { .. }) {
            return false;
        }
        self.state.current_time = self.clamp_time(position);
        true
    }

    /// Commits the scrub position and returns to the pre-scrub state.
    pub fn pointer_up(&mut self, position: f64, now: Instant) -> bool {
        let PlaybackStatus::Scrubbing { resume_playing } = self.state.status else {
            return false;
        };
        let target = self.clamp_time(position);
        let Some(element) = self.live() else {
            return false;
        };
        element.seek(target);
        self.state.current_time = target;
        self.state.status = if resume_playing {
            PlaybackStatus::Playing
        } else {
            PlaybackStatus::Paused
        };
        self.show_controls(now);
        true
    }

    pub fn skip_forward(&mut self, now: Instant) -> bool {
        self.skip_by(self.config.skip_seconds, now)
    }

    pub fn skip_backward(&mut self, now: Instant) -> bool {
        self.skip_by(-self.config.skip_seconds, now)
    }

    fn skip_by(&mut self, delta: f64, now: Instant) -> bool {
        if matches!(
            self.state.status,
            PlaybackStatus::Poster | PlaybackStatus::Scrubbing { .. }
        ) {
            return false;
        }
        let target = self.clamp_time(self.state.current_time + delta);
        let Some(element) = self.live() else {
            return false;
        };
        element.seek(target);
        self.state.current_time = target;
        self.show_controls(now);
        true
    }

    pub fn toggle_mute(&mut self, now: Instant) -> bool {
        let muted = !self.state.muted;
        let Some(element) = self.live() else {
            return false;
        };
        element.set_muted(muted);
        self.state.muted = muted;
        self.show_controls(now);
        true
    }

    /// Enters or leaves fullscreen through the first entry point the element supports.
    pub fn toggle_fullscreen(&mut self, now: Instant) -> FullscreenSupport {
        let enter = !self.state.is_fullscreen;
        let known = self.fullscreen_api;
        let Some(element) = self.live() else {
            return FullscreenSupport::Unsupported;
        };
        let candidates: Vec<FullscreenApi> = match known {
            Some(api) => vec![api],
            None => FullscreenApi::PRIORITY.to_vec(),
        };
        let chosen = candidates
            .into_iter()
            .find(|api| element.request_fullscreen(*api, enter));
        match chosen {
            Some(api) => {
                self.fullscreen_api = Some(api);
                self.state.is_fullscreen = enter;
                self.show_controls(now);
                FullscreenSupport::Supported(api)
            }
            None => {
                debug!(media = %self.media_id, "fullscreen unsupported");
                FullscreenSupport::Unsupported
            }
        }
    }

    /// Duration reported by the element. Anything unusable leaves it at zero, which keeps
    /// scrubbing disabled.
    pub fn on_metadata(&mut self, duration: f64) {
        if self.element.is_none() {
            return;
        }
        if duration.is_finite() && duration > 0.0 {
            self.state.duration = duration;
            self.state.current_time = self.clamp_time(self.state.current_time);
        } else {
            debug!(media = %self.media_id, duration, "metadata without usable duration");
        }
    }

    pub fn on_time_update(&mut self, seconds: f64) {
        if self.element.is_none() || !seconds.is_finite() {
            return;
        }
        if matches!(self.state.status, PlaybackStatus::Scrubbing { .. }) {
            return;
        }
        self.state.current_time = if self.state.duration > 0.0 {
            self.clamp_time(seconds)
        } else {
            seconds.max(0.0)
        };
    }

    pub fn on_ended(&mut self, now: Instant) {
        if self.element.is_none() || self.state.status != PlaybackStatus::Playing {
            return;
        }
        self.state.status = PlaybackStatus::Paused;
        self.state.current_time = self.state.duration;
        self.show_controls(now);
    }

    /// Starts a progress query. `None` while one is already out or nothing is mounted.
    pub fn begin_sample(&mut self) -> Option<Sampler> {
        if self.sampling {
            return None;
        }
        let sampler = self.live()?.sampler()?;
        self.sampling = true;
        Some(sampler)
    }

    /// Feeds a finished query through the event handlers. Samples nobody asked for
    /// are ignored.
    pub fn apply_sample(&mut self, sample: ElementSample, now: Instant) -> bool {
        if !std::mem::take(&mut self.sampling) {
            return false;
        }
        let Some(element) = self.live() else {
            return false;
        };
        element.observe(&sample);
        if let Some(duration) = sample.duration {
            if self.state.duration == 0.0 {
                self.on_metadata(duration);
            }
        }
        if let Some(position) = sample.position {
            self.on_time_update(position);
        }
        if sample.ended {
            self.on_ended(now);
        }
        true
    }

    fn fail(&mut self, err: PlaybackError) -> PlaybackError {
        warn!(media = %self.media_id, error = %err, "media unplayable");
        if let Some(element) = self.element.as_mut() {
            element.pause();
        }
        self.hide_task = None;
        self.overlay_visible = true;
        self.failure = Some(err.clone());
        err
    }

    /// Shows the overlay and, while playing, schedules it to hide again.
    pub fn show_controls(&mut self, now: Instant) {
        if self.element.is_none() {
            return;
        }
        self.overlay_visible = true;
        self.hide_task = match self.state.status {
            PlaybackStatus::Playing => Some(ScheduledTask::after(
                now,
                self.config.controls_idle_timeout,
            )),
            _ => None,
        };
    }

    /// Fires the auto-hide task if it is due. Returns whether anything changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        let Some(task) = self.hide_task else {
            return false;
        };
        if !task.is_due(now) {
            return false;
        }
        self.hide_task = None;
        if self.state.status == PlaybackStatus::Playing {
            self.overlay_visible = false;
            return true;
        }
        false
    }

    /// Releases the element and cancels pending tasks. Later calls are no-ops.
    pub fn unmount(&mut self) {
        self.hide_task = None;
        self.sampling = false;
        if let Some(mut element) = self.element.take() {
            if self.state.is_fullscreen {
                if let Some(api) = self.fullscreen_api {
                    element.request_fullscreen(api, false);
                }
            }
            element.pause();
            element.release();
            debug!(media = %self.media_id, "media element released");
        }
    }

    fn clamp_time(&self, seconds: f64) -> f64 {
        if !seconds.is_finite() {
            return 0.0;
        }
        seconds.clamp(0.0, self.state.duration.max(0.0))
    }
}

impl Drop for MediaPlaybackController {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// `m:ss`, or `h:mm:ss` past an hour. Unknown or negative times render as `0:00`.
pub fn format_timestamp(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::model::MediaAttachment;

    #[derive(Debug, Default)]
    struct Log {
        calls: Vec<String>,
    }

    struct Recorder {
        log: Arc<Mutex<Log>>,
        supports: Vec<FullscreenApi>,
        fail_play: bool,
    }

    impl Recorder {
        fn new(supports: Vec<FullscreenApi>) -> (Self, Arc<Mutex<Log>>) {
            let log = Arc::new(Mutex::new(Log::default()));
            (
                Self {
                    log: log.clone(),
                    supports,
                    fail_play: false,
                },
                log,
            )
        }

        fn push(&self, call: String) {
            self.log.lock().calls.push(call);
        }
    }

    impl MediaElement for Recorder {
        fn play(&mut self) -> Result<(), PlaybackError> {
            self.push("play".into());
            if self.fail_play {
                return Err(PlaybackError::LoadFailed("404".into()));
            }
            Ok(())
        }
        fn pause(&mut self) {
            self.push("pause".into());
        }
        fn set_muted(&mut self, muted: bool) {
            self.push(format!("muted={muted}"));
        }
        fn seek(&mut self, seconds: f64) {
            self.push(format!("seek={seconds}"));
        }
        fn request_fullscreen(&mut self, api: FullscreenApi, enter: bool) -> bool {
            self.push(format!("fullscreen {api:?} {enter}"));
            self.supports.contains(&api)
        }
        fn release(&mut self) {
            self.push("release".into());
        }
    }

    fn video() -> MediaAttachment {
        MediaAttachment::from_url("m1", "https://cdn.test/clip.mp4")
    }

    fn controller(supports: Vec<FullscreenApi>) -> (MediaPlaybackController, Arc<Mutex<Log>>) {
        let (element, log) = Recorder::new(supports);
        (
            MediaPlaybackController::new(&video(), Box::new(element), PlaybackConfig::default()),
            log,
        )
    }

    #[test]
    fn poster_tap_unmutes_and_plays() {
        let (mut player, log) = controller(vec![]);
        let now = Instant::now();
        assert!(player.state().muted);
        player.tap_play(now).unwrap();
        assert_eq!(player.status(), PlaybackStatus::Playing);
        assert!(!player.state().muted);
        assert_eq!(log.lock().calls, ["muted=false", "play"]);
        assert!(player.overlay_visible());
        assert!(player.hide_task().is_some());
    }

    #[test]
    fn tap_toggles_between_playing_and_paused() {
        let (mut player, _) = controller(vec![]);
        let now = Instant::now();
        player.tap(now).unwrap();
        player.tap(now).unwrap();
        assert_eq!(player.status(), PlaybackStatus::Paused);
        assert!(player.hide_task().is_none());
        player.tap(now).unwrap();
        assert_eq!(player.status(), PlaybackStatus::Playing);
    }

    #[test]
    fn overlay_hides_after_idle_timeout_only_while_playing() {
        let (mut player, _) = controller(vec![]);
        let now = Instant::now();
        player.tap_play(now).unwrap();
        assert!(!player.tick(now + Duration::from_secs(1)));
        assert!(player.overlay_visible());
        assert!(player.tick(now + Duration::from_secs(3)));
        assert!(!player.overlay_visible());

        player.tap(now + Duration::from_secs(4)).unwrap();
        assert!(!player.tick(now + Duration::from_secs(60)));
        assert!(player.overlay_visible());
    }

    #[test]
    fn scrubbing_pins_overlay_and_restores_previous_state() {
        let (mut player, log) = controller(vec![]);
        let now = Instant::now();
        player.tap_play(now).unwrap();
        player.on_metadata(120.0);
        assert!(player.pointer_down(30.0));
        assert_eq!(
            player.status(),
            PlaybackStatus::Scrubbing {
                resume_playing: true
            }
        );
        assert!(player.hide_task().is_none());
        assert!(!player.tick(now + Duration::from_secs(10)));
        assert!(player.overlay_visible());

        player.on_time_update(99.0);
        assert_eq!(player.state().current_time, 30.0);
        assert!(player.pointer_move(500.0));
        assert!(player.pointer_up(500.0, now));
        assert_eq!(player.status(), PlaybackStatus::Playing);
        assert_eq!(player.state().current_time, 120.0);
        assert!(log.lock().calls.contains(&"seek=120".to_string()));
    }

    #[test]
    fn scrubbing_disabled_without_duration() {
        let (mut player, _) = controller(vec![]);
        let now = Instant::now();
        player.tap_play(now).unwrap();
        player.on_metadata(f64::NAN);
        assert_eq!(player.state().duration, 0.0);
        assert!(!player.pointer_down(3.0));
        assert_eq!(player.status(), PlaybackStatus::Playing);
        assert_eq!(format_timestamp(player.state().duration), "0:00");
    }

    #[test]
    fn skip_clamps_to_bounds_and_keeps_status() {
        let (mut player, _) = controller(vec![]);
        let now = Instant::now();
        player.tap_play(now).unwrap();
        player.on_metadata(100.0);
        player.on_time_update(95.0);
        assert!(player.skip_forward(now));
        assert_eq!(player.state().current_time, 100.0);
        assert_eq!(player.status(), PlaybackStatus::Playing);

        player.tap(now).unwrap();
        player.on_time_update(4.0);
        assert!(player.skip_backward(now));
        assert_eq!(player.state().current_time, 0.0);
        assert_eq!(player.status(), PlaybackStatus::Paused);
    }

    #[test]
    fn fullscreen_uses_first_supported_api() {
        let (mut player, log) = controller(vec![FullscreenApi::Moz, FullscreenApi::Ms]);
        let now = Instant::now();
        player.tap_play(now).unwrap();
        assert_eq!(
            player.toggle_fullscreen(now),
            FullscreenSupport::Supported(FullscreenApi::Moz)
        );
        assert!(player.state().is_fullscreen);
        assert_eq!(
            player.toggle_fullscreen(now),
            FullscreenSupport::Supported(FullscreenApi::Moz)
        );
        assert!(!player.state().is_fullscreen);
        let calls = log.lock().calls.clone();
        assert_eq!(
            calls[2..],
            [
                "fullscreen Standard true",
                "fullscreen Webkit true",
                "fullscreen Moz true",
                "fullscreen Moz false",
            ]
        );
    }

    #[test]
    fn unsupported_fullscreen_is_a_no_op() {
        let (mut player, _) = controller(vec![]);
        let now = Instant::now();
        player.tap_play(now).unwrap();
        assert_eq!(player.toggle_fullscreen(now), FullscreenSupport::Unsupported);
        assert!(!player.state().is_fullscreen);
    }

    #[test]
    fn load_failure_makes_controller_inert() {
        let (mut element, _) = Recorder::new(vec![]);
        element.fail_play = true;
        let mut player =
            MediaPlaybackController::new(&video(), Box::new(element), PlaybackConfig::default());
        let now = Instant::now();
        assert!(matches!(
            player.tap_play(now),
            Err(PlaybackError::LoadFailed(_))
        ));
        assert!(player.is_unplayable());
        assert_eq!(player.status(), PlaybackStatus::Poster);
        assert!(player.tap_play(now).is_ok());
        assert!(!player.toggle_mute(now));
        assert!(!player.skip_forward(now));
    }

    #[test]
    fn images_are_unplayable_from_the_start() {
        let image = MediaAttachment::from_url("i1", "https://cdn.test/a.png");
        let player = MediaPlaybackController::new(
            &image,
            Box::new(HeadlessElement::default()),
            PlaybackConfig::default(),
        );
        assert_eq!(
            player.failure(),
            Some(&PlaybackError::Unplayable("i1".into()))
        );
    }

    #[test]
    fn unmount_releases_and_silences() {
        let (mut player, log) = controller(vec![FullscreenApi::Standard]);
        let now = Instant::now();
        player.tap_play(now).unwrap();
        player.toggle_fullscreen(now);
        player.unmount();
        assert!(!player.is_mounted());
        assert!(player.hide_task().is_none());
        let released_at = log.lock().calls.len();
        assert_eq!(
            log.lock().calls[released_at - 3..],
            ["fullscreen Standard false", "pause", "release"]
        );

        assert!(!player.tick(now + Duration::from_secs(10)));
        assert!(!player.toggle_mute(now));
        player.on_metadata(30.0);
        assert_eq!(player.state().duration, 0.0);
        drop(player);
        assert_eq!(log.lock().calls.len(), released_at);
    }

    struct Scripted(Vec<ElementSample>);

    impl MediaElement for Scripted {
        fn play(&mut self) -> Result<(), PlaybackError> {
            Ok(())
        }
        fn pause(&mut self) {}
        fn set_muted(&mut self, _muted: bool) {}
        fn seek(&mut self, _seconds: f64) {}
        fn request_fullscreen(&mut self, _api: FullscreenApi, _enter: bool) -> bool {
            false
        }
        fn sampler(&mut self) -> Option<Sampler> {
            let sample = self.0.pop()?;
            Some(Box::new(move || sample))
        }
    }

    fn run(player: &mut MediaPlaybackController, now: Instant) -> bool {
        match player.begin_sample() {
            Some(sampler) => player.apply_sample(sampler(), now),
            None => false,
        }
    }

    #[test]
    fn element_samples_drive_progress_and_end() {
        let samples = vec![
            ElementSample {
                position: Some(42.0),
                duration: Some(42.0),
                ended: true,
            },
            ElementSample {
                position: Some(12.5),
                duration: Some(42.0),
                ended: false,
            },
        ];
        let mut player = MediaPlaybackController::new(
            &video(),
            Box::new(Scripted(samples)),
            PlaybackConfig::default(),
        );
        let now = Instant::now();
        player.tap_play(now).unwrap();
        assert!(run(&mut player, now));
        assert_eq!(player.state().duration, 42.0);
        assert_eq!(player.state().current_time, 12.5);
        assert!(run(&mut player, now));
        assert_eq!(player.status(), PlaybackStatus::Paused);
        assert_eq!(player.progress(), 1.0);
        assert!(!run(&mut player, now));
    }

    #[test]
    fn one_sample_in_flight_at_a_time() {
        let sample = ElementSample {
            position: Some(3.0),
            duration: Some(10.0),
            ended: false,
        };
        let mut player = MediaPlaybackController::new(
            &video(),
            Box::new(Scripted(vec![sample, sample])),
            PlaybackConfig::default(),
        );
        let now = Instant::now();
        player.tap_play(now).unwrap();
        let sampler = player.begin_sample().unwrap();
        assert!(player.begin_sample().is_none());
        assert!(player.apply_sample(sampler(), now));
        assert_eq!(player.state().current_time, 3.0);
        // A second result for the same query changes nothing.
        assert!(!player.apply_sample(sample, now));
        assert!(player.begin_sample().is_some());
    }

    #[test]
    fn samples_after_unmount_are_dropped() {
        let sample = ElementSample {
            position: Some(5.0),
            duration: Some(10.0),
            ended: false,
        };
        let mut player = MediaPlaybackController::new(
            &video(),
            Box::new(Scripted(vec![sample])),
            PlaybackConfig::default(),
        );
        let now = Instant::now();
        player.tap_play(now).unwrap();
        let sampler = player.begin_sample().unwrap();
        player.unmount();
        assert!(!player.apply_sample(sampler(), now));
        assert_eq!(player.state().current_time, 0.0);
    }

    #[test]
    fn timestamps() {
        assert_eq!(format_timestamp(0.0), "0:00");
        assert_eq!(format_timestamp(f64::NAN), "0:00");
        assert_eq!(format_timestamp(65.9), "1:05");
        assert_eq!(format_timestamp(3725.0), "1:02:05");
    }
}
