// SPDX-License-Identifier: MPL-2.0

//! One media playback handle bound to one monitor's background surface.
//!
//! ```text
//! Uninitialized ──create──▶ Playing ◀──pause/resume──▶ Paused
//!                              │                          │
//!                              └────────destroy──────────▶ Destroyed
//! ```

pub mod worker;

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use live_bg_config::{DEFAULT_SPEED, SAFE_MAX_SPEED};

use crate::{error::SessionError, frame_queue::SharedFrameQueue, topology::MonitorId};

/// Where a session delivers its frames, and at which pixel size.
#[derive(Clone)]
pub struct SurfaceBinding {
    pub monitor: MonitorId,
    pub width: u32,
    pub height: u32,
    pub frames: SharedFrameQueue,
}

impl fmt::Debug for SurfaceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceBinding")
            .field("monitor", &self.monitor)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// External playback capability. Each session owns its own handle.
pub trait MediaBackend: Send + Sync {
    /// Open `source` for playback. Fails with [`SessionError::SourceLoad`]
    /// when the source cannot be decoded.
    fn open(&self, source: &Path) -> Result<Box<dyn MediaHandle>, SessionError>;
}

pub trait MediaHandle: Send {
    /// Route output to `surface`; may be called again when the surface is resized.
    fn bind_to_surface(&mut self, surface: &SurfaceBinding) -> Result<(), SessionError>;
    fn play(&mut self) -> Result<(), SessionError>;
    fn pause(&mut self) -> Result<(), SessionError>;
    /// Linear volume in `0.0..=1.0`.
    fn set_volume(&mut self, volume: f64);
    fn set_mute(&mut self, muted: bool);
    /// Playback rate from the current position, also kept when looping.
    fn set_rate(&mut self, rate: f64) -> Result<(), SessionError>;
    /// Answer within `timeout`, or report the backend as lost.
    fn check_alive(&mut self, timeout: Duration) -> Result<(), SessionError>;
    /// Release every backend resource. Called exactly once.
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Playing,
    Paused,
    Destroyed,
}

/// What a session plays, how loud and how fast.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub source: PathBuf,
    pub volume: u8,
    pub muted: bool,
    pub speed: f64,
}

fn linear_volume(volume: u8) -> f64 {
    f64::from(volume.min(100)) / 100.0
}

fn is_normal_speed(speed: f64) -> bool {
    (speed - DEFAULT_SPEED).abs() <= f64::EPSILON
}

/// Set `speed` on `handle` and return the rate actually in effect.
///
/// A refused rate above [`SAFE_MAX_SPEED`] is retried at that rate.
fn apply_speed(handle: &mut dyn MediaHandle, monitor: &MonitorId, speed: f64) -> f64 {
    let why = match handle.set_rate(speed) {
        Ok(()) => return speed,
        Err(why) => why,
    };
    if speed > SAFE_MAX_SPEED {
        tracing::warn!(output = %monitor, speed, fallback = SAFE_MAX_SPEED, %why, "playback rate refused");
        match handle.set_rate(SAFE_MAX_SPEED) {
            Ok(()) => return SAFE_MAX_SPEED,
            Err(why) => tracing::warn!(output = %monitor, %why, "playback rate refused"),
        }
    } else {
        tracing::warn!(output = %monitor, speed, %why, "playback rate refused");
    }
    DEFAULT_SPEED
}

fn open_bound(
    backend: &dyn MediaBackend,
    source: &Path,
    binding: &SurfaceBinding,
    volume: u8,
    muted: bool,
) -> Result<Box<dyn MediaHandle>, SessionError> {
    let mut handle = backend.open(source)?;
    if let Err(err) = handle.bind_to_surface(binding) {
        handle.close();
        return Err(err);
    }
    handle.set_volume(linear_volume(volume));
    handle.set_mute(muted);
    Ok(handle)
}

pub struct PlaybackSession {
    monitor: MonitorId,
    source: PathBuf,
    state: SessionState,
    volume: u8,
    muted: bool,
    speed: f64,
    binding: SurfaceBinding,
    handle: Option<Box<dyn MediaHandle>>,
}

impl fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("monitor", &self.monitor)
            .field("source", &self.source)
            .field("state", &self.state)
            .field("volume", &self.volume)
            .field("muted", &self.muted)
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

impl PlaybackSession {
    /// Open the source, bind it to the surface and start it, or leave it
    /// paused when `paused` is set.
    pub fn create(
        backend: &dyn MediaBackend,
        binding: SurfaceBinding,
        params: SessionParams,
        paused: bool,
    ) -> Result<Self, SessionError> {
        let handle = open_bound(backend, &params.source, &binding, params.volume, params.muted)?;

        let mut session = Self {
            monitor: binding.monitor.clone(),
            source: params.source,
            state: SessionState::Uninitialized,
            volume: params.volume.min(100),
            muted: params.muted,
            speed: params.speed,
            binding,
            handle: Some(handle),
        };

        if paused {
            session.pause()?;
        } else {
            session.resume()?;
        }

        tracing::debug!(
            output = %session.monitor,
            source = %session.source.display(),
            state = ?session.state,
            "session created"
        );
        Ok(session)
    }

    fn handle(&mut self) -> Result<&mut Box<dyn MediaHandle>, SessionError> {
        self.handle.as_mut().ok_or(SessionError::Destroyed)
    }

    /// Idempotent: pausing a paused session does nothing.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Paused => Ok(()),
            SessionState::Destroyed => Err(SessionError::Destroyed),
            SessionState::Uninitialized | SessionState::Playing => {
                self.handle()?.pause()?;
                self.state = SessionState::Paused;
                Ok(())
            }
        }
    }

    /// Idempotent: resuming a playing session does nothing.
    ///
    /// The playback rate is set again after every start, as backends may
    /// reset it on a state change.
    pub fn resume(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Playing => Ok(()),
            SessionState::Destroyed => Err(SessionError::Destroyed),
            SessionState::Uninitialized | SessionState::Paused => {
                self.handle()?.play()?;
                self.state = SessionState::Playing;
                self.reapply_speed();
                Ok(())
            }
        }
    }

    fn reapply_speed(&mut self) {
        if is_normal_speed(self.speed) {
            return;
        }
        if let Some(handle) = self.handle.as_mut() {
            self.speed = apply_speed(handle.as_mut(), &self.monitor, self.speed);
        }
    }

    /// Switch to another source on the same surface.
    ///
    /// The new source is fully opened before the old one is closed; on
    /// failure the session keeps playing its previous source.
    pub fn set_source(
        &mut self,
        backend: &dyn MediaBackend,
        source: &Path,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Destroyed {
            return Err(SessionError::Destroyed);
        }

        let mut next = open_bound(backend, source, &self.binding, self.volume, self.muted)?;
        let started = match self.state {
            SessionState::Paused => next.pause(),
            _ => next.play(),
        };
        if let Err(err) = started {
            next.close();
            return Err(err);
        }

        if let Some(mut previous) = self.handle.replace(next) {
            previous.close();
        }
        if self.state == SessionState::Playing {
            self.reapply_speed();
        }
        tracing::debug!(
            output = %self.monitor,
            from = %self.source.display(),
            to = %source.display(),
            "session source replaced"
        );
        self.source = source.to_path_buf();
        Ok(())
    }

    /// Follow a resized surface.
    pub fn rebind(&mut self, binding: SurfaceBinding) -> Result<(), SessionError> {
        self.handle()?.bind_to_surface(&binding)?;
        self.binding = binding;
        Ok(())
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(100);
        if let Some(handle) = self.handle.as_mut() {
            handle.set_volume(linear_volume(self.volume));
        }
    }

    pub fn set_mute(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(handle) = self.handle.as_mut() {
            handle.set_mute(muted);
        }
    }

    /// Change the playback rate. A paused session seeks right away too.
    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed;
        if let Some(handle) = self.handle.as_mut() {
            self.speed = apply_speed(handle.as_mut(), &self.monitor, speed);
        }
    }

    pub fn check_liveness(&mut self, timeout: Duration) -> Result<(), SessionError> {
        self.handle()?.check_alive(timeout)
    }

    /// Release the backend handle. Idempotent.
    ///
    /// The frame queue belongs to the surface and stays open, so a session
    /// recreated on the same surface keeps presenting.
    pub fn destroy(&mut self) {
        if self.state == SessionState::Destroyed {
            return;
        }
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        self.state = SessionState::Destroyed;
        tracing::debug!(output = %self.monitor, "session destroyed");
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    #[must_use]
    pub fn volume(&self) -> u8 {
        self.volume
    }

    #[must_use]
    pub fn muted(&self) -> bool {
        self.muted
    }

    #[must_use]
    pub fn speed(&self) -> f64 {
        self.speed
    }

    #[must_use]
    pub fn monitor(&self) -> &MonitorId {
        &self.monitor
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory media backend recording every call.

    use super::*;
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
    };

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub log: Vec<String>,
        pub broken: HashSet<PathBuf>,
        pub dead: HashSet<PathBuf>,
        pub fail_bind: bool,
        pub open: usize,
        /// Rates above this are refused.
        pub max_rate: Option<f64>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeBackend {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeBackend {
        pub fn break_source(&self, path: &Path) {
            self.state.lock().unwrap().broken.insert(path.to_path_buf());
        }

        pub fn kill(&self, path: &Path) {
            self.state.lock().unwrap().dead.insert(path.to_path_buf());
        }

        pub fn revive(&self, path: &Path) {
            self.state.lock().unwrap().dead.remove(path);
        }

        pub fn set_fail_bind(&self, fail: bool) {
            self.state.lock().unwrap().fail_bind = fail;
        }

        pub fn set_max_rate(&self, max: f64) {
            self.state.lock().unwrap().max_rate = Some(max);
        }

        pub fn open_handles(&self) -> usize {
            self.state.lock().unwrap().open
        }

        pub fn log(&self) -> Vec<String> {
            self.state.lock().unwrap().log.clone()
        }

        pub fn count(&self, entry: &str) -> usize {
            self.log().iter().filter(|e| e.as_str() == entry).count()
        }
    }

    struct FakeHandle {
        source: PathBuf,
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeHandle {
        fn record(&self, op: &str) {
            let name = self
                .source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.state.lock().unwrap().log.push(format!("{op} {name}"));
        }
    }

    impl MediaBackend for FakeBackend {
        fn open(&self, source: &Path) -> Result<Box<dyn MediaHandle>, SessionError> {
            let mut state = self.state.lock().unwrap();
            if state.broken.contains(source) {
                return Err(SessionError::source_load(source, "corrupt"));
            }
            state.open += 1;
            drop(state);

            let handle = FakeHandle {
                source: source.to_path_buf(),
                state: Arc::clone(&self.state),
            };
            handle.record("open");
            Ok(Box::new(handle))
        }
    }

    impl MediaHandle for FakeHandle {
        fn bind_to_surface(&mut self, surface: &SurfaceBinding) -> Result<(), SessionError> {
            if self.state.lock().unwrap().fail_bind {
                return Err(SessionError::SurfaceBind("no surface".into()));
            }
            self.record(&format!("bind {}x{}", surface.width, surface.height));
            Ok(())
        }

        fn play(&mut self) -> Result<(), SessionError> {
            self.record("play");
            Ok(())
        }

        fn pause(&mut self) -> Result<(), SessionError> {
            self.record("pause");
            Ok(())
        }

        fn set_volume(&mut self, volume: f64) {
            self.record(&format!("volume {volume:.2}"));
        }

        fn set_mute(&mut self, muted: bool) {
            self.record(&format!("mute {muted}"));
        }

        fn set_rate(&mut self, rate: f64) -> Result<(), SessionError> {
            if self.state.lock().unwrap().max_rate.is_some_and(|max| rate > max) {
                return Err(SessionError::BackendLost(format!("rate {rate} refused")));
            }
            self.record(&format!("rate {rate:.2}"));
            Ok(())
        }

        fn check_alive(&mut self, _timeout: Duration) -> Result<(), SessionError> {
            if self.state.lock().unwrap().dead.contains(&self.source) {
                return Err(SessionError::BackendLost("player died".into()));
            }
            Ok(())
        }

        fn close(&mut self) {
            self.record("close");
            self.state.lock().unwrap().open -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{fake::FakeBackend, *};
    use crate::frame_queue::{Frame, new_shared_queue};

    fn binding() -> SurfaceBinding {
        SurfaceBinding {
            monitor: MonitorId::new("DP-1"),
            width: 1920,
            height: 1080,
            frames: new_shared_queue(2),
        }
    }

    fn params(source: &str) -> SessionParams {
        SessionParams {
            source: PathBuf::from(source),
            volume: 40,
            muted: false,
            speed: DEFAULT_SPEED,
        }
    }

    #[test]
    fn test_create_playing_or_paused() {
        let backend = FakeBackend::default();
        let playing = PlaybackSession::create(&backend, binding(), params("/a.mp4"), false).unwrap();
        assert_eq!(playing.state(), SessionState::Playing);

        let paused = PlaybackSession::create(&backend, binding(), params("/b.mp4"), true).unwrap();
        assert_eq!(paused.state(), SessionState::Paused);
        assert_eq!(backend.count("play b.mp4"), 0);
        assert_eq!(backend.count("volume 0.40 b.mp4"), 1);
        assert_eq!(backend.count("mute false b.mp4"), 1);
        assert_eq!(backend.count("bind 1920x1080 b.mp4"), 1);
    }

    #[test]
    fn test_pause_is_idempotent() {
        let backend = FakeBackend::default();
        let mut session =
            PlaybackSession::create(&backend, binding(), params("/a.mp4"), false).unwrap();
        session.pause().unwrap();
        session.pause().unwrap();
        assert_eq!(backend.count("pause a.mp4"), 1);
        session.resume().unwrap();
        session.resume().unwrap();
        assert_eq!(backend.count("play a.mp4"), 2);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let backend = FakeBackend::default();
        let bind = binding();
        let frames = bind.frames.clone();
        let mut session = PlaybackSession::create(&backend, bind, params("/a.mp4"), false).unwrap();

        session.destroy();
        session.destroy();
        drop(session);

        assert_eq!(backend.count("close a.mp4"), 1);
        assert_eq!(backend.open_handles(), 0);
        assert!(!frames.is_closed());
    }

    #[test]
    fn test_recreate_on_same_surface_keeps_frames_flowing() {
        let backend = FakeBackend::default();
        let bind = binding();
        let mut first =
            PlaybackSession::create(&backend, bind.clone(), params("/a.mp4"), false).unwrap();
        first.destroy();

        let _second = PlaybackSession::create(&backend, bind.clone(), params("/a.mp4"), false).unwrap();
        assert!(bind.frames.push(Frame::new(vec![0; 4], 1, 1, Some(1))));
        assert_eq!(bind.frames.take_latest().and_then(|frame| frame.pts_ns), Some(1));
    }

    #[test]
    fn test_speed_applied_after_every_resume() {
        let backend = FakeBackend::default();
        let mut session = PlaybackSession::create(
            &backend,
            binding(),
            SessionParams {
                speed: 1.5,
                ..params("/a.mp4")
            },
            true,
        )
        .unwrap();
        assert_eq!(backend.count("rate 1.50 a.mp4"), 0);

        session.resume().unwrap();
        session.pause().unwrap();
        session.resume().unwrap();
        assert_eq!(backend.count("rate 1.50 a.mp4"), 2);
        assert_eq!(session.speed(), 1.5);
    }

    #[test]
    fn test_normal_speed_never_seeks() {
        let backend = FakeBackend::default();
        let mut session =
            PlaybackSession::create(&backend, binding(), params("/a.mp4"), false).unwrap();
        session.pause().unwrap();
        session.resume().unwrap();
        assert!(!backend.log().iter().any(|entry| entry.starts_with("rate")));
    }

    #[test]
    fn test_refused_fast_rate_falls_back() {
        let backend = FakeBackend::default();
        backend.set_max_rate(SAFE_MAX_SPEED);
        let mut session =
            PlaybackSession::create(&backend, binding(), params("/a.mp4"), false).unwrap();

        session.set_speed(2.5);
        assert_eq!(session.speed(), SAFE_MAX_SPEED);
        assert_eq!(backend.count("rate 2.00 a.mp4"), 1);
        assert_eq!(backend.count("rate 2.50 a.mp4"), 0);
    }

    #[test]
    fn test_speed_survives_source_switch() {
        let backend = FakeBackend::default();
        let mut session =
            PlaybackSession::create(&backend, binding(), params("/a.mp4"), false).unwrap();
        session.set_speed(0.5);
        session.set_source(&backend, Path::new("/b.mp4")).unwrap();
        assert_eq!(session.speed(), 0.5);
        assert_eq!(backend.count("rate 0.50 b.mp4"), 1);
    }

    #[test]
    fn test_operations_after_destroy_fail() {
        let backend = FakeBackend::default();
        let mut session =
            PlaybackSession::create(&backend, binding(), params("/a.mp4"), false).unwrap();
        session.destroy();
        assert_eq!(session.pause(), Err(SessionError::Destroyed));
        assert_eq!(session.resume(), Err(SessionError::Destroyed));
        assert_eq!(
            session.set_source(&backend, Path::new("/b.mp4")),
            Err(SessionError::Destroyed)
        );
        // Volume stays settable in every state.
        session.set_volume(70);
        assert_eq!(session.volume(), 70);
    }

    #[test]
    fn test_set_source_keeps_previous_on_failure() {
        let backend = FakeBackend::default();
        backend.break_source(Path::new("/bad.mp4"));
        let mut session =
            PlaybackSession::create(&backend, binding(), params("/a.mp4"), false).unwrap();

        let err = session
            .set_source(&backend, Path::new("/bad.mp4"))
            .unwrap_err();
        assert!(matches!(err, SessionError::SourceLoad { .. }));
        assert_eq!(session.source(), Path::new("/a.mp4"));
        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(backend.open_handles(), 1);
    }

    #[test]
    fn test_set_source_swaps_handles_and_keeps_pause() {
        let backend = FakeBackend::default();
        let mut session =
            PlaybackSession::create(&backend, binding(), params("/a.mp4"), true).unwrap();
        session.set_source(&backend, Path::new("/b.mp4")).unwrap();

        assert_eq!(session.source(), Path::new("/b.mp4"));
        assert_eq!(session.state(), SessionState::Paused);
        assert_eq!(backend.count("pause b.mp4"), 1);
        assert_eq!(backend.count("close a.mp4"), 1);
        assert_eq!(backend.open_handles(), 1);
    }

    #[test]
    fn test_bind_failure_releases_handle() {
        let backend = FakeBackend::default();
        backend.set_fail_bind(true);
        let err = PlaybackSession::create(&backend, binding(), params("/a.mp4"), false).unwrap_err();
        assert!(matches!(err, SessionError::SurfaceBind(_)));
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn test_liveness() {
        let backend = FakeBackend::default();
        let mut session =
            PlaybackSession::create(&backend, binding(), params("/a.mp4"), false).unwrap();
        assert!(session.check_liveness(Duration::from_secs(1)).is_ok());
        backend.kill(Path::new("/a.mp4"));
        assert!(matches!(
            session.check_liveness(Duration::from_secs(1)),
            Err(SessionError::BackendLost(_))
        ));
    }
}
