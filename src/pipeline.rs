//! Capture-backed video source
//!
//! A [`Pipeline`] owns one capture session and the adapter registry it
//! feeds. Adding the first track queries the device formats and starts
//! capture; stopping the last track stops it again. Capture state is fanned
//! out to the tracks: a device error or end ends every track, a silent
//! source mutes them.

use crate::adapter::{ConstraintSet, TrackAdapterRegistry, TrackId};
use crate::cancel::CancellationToken;
use crate::capture::{CaptureHost, CaptureState, ClientId, SessionId, VideoCaptureClient};
use crate::config::{CaptureConfig, MonitorConfig, PipelineConfig, Preset};
use crate::error::{Error, FailureCode, Result};
use crate::task::PipelineContext;
use crate::track::{ReadyState, TrackShared, TrackSource, VideoTrack};
use crate::types::{Stats, VideoCaptureFormat};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Result reported to a track's start callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Failed { code: FailureCode, name: String },
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started)
    }
}

type StartCallback = Box<dyn FnOnce(StartOutcome) + Send>;

/// Lifecycle of the capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceState {
    /// No track, no capture
    Idle,
    Starting,
    Started,
    /// The device failed or went away; terminal
    Ended,
}

/// The single capture client of a pipeline
const CLIENT_ID: ClientId = 1;

struct Inner {
    ctx: PipelineContext,
    client: VideoCaptureClient,
    registry: TrackAdapterRegistry,
    capture: CaptureConfig,
    monitor: MonitorConfig,
    alive: CancellationToken,
    state: Mutex<SourceState>,
    tracks: Mutex<HashMap<TrackId, Arc<TrackShared>>>,
    pending: Mutex<Vec<StartCallback>>,
    next_track_id: AtomicU64,
    /// Bumped on every start so a format answer from an abandoned start is
    /// ignored
    start_generation: AtomicU64,
}

impl Inner {
    fn report(&self, callback: StartCallback, outcome: StartOutcome) {
        self.ctx
            .main
            .post(self.alive.bind(move || callback(outcome)));
    }

    fn start_source(self: &Arc<Self>) {
        tracing::info!(
            "Starting capture session {} at {} {}",
            self.client.session_id(),
            self.capture.resolution,
            self.capture.framerate
        );
        let generation = self.start_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let weak = Arc::downgrade(self);
        self.client.get_device_supported_formats(move |formats| {
            if let Some(inner) = weak.upgrade() {
                inner.on_supported_formats(generation, formats);
            }
        });
    }

    /// Main runner
    fn on_supported_formats(self: &Arc<Self>, generation: u64, formats: Vec<VideoCaptureFormat>) {
        {
            let state = self.state.lock();
            if *state != SourceState::Starting {
                tracing::debug!("Capture no longer wanted, not starting");
                return;
            }
            if self.start_generation.load(Ordering::Acquire) != generation {
                tracing::debug!("Formats answer for start {} superseded", generation);
                return;
            }
        }

        let params = self.capture.params();
        let requested = params.requested_format;
        let source_fps = formats
            .iter()
            .find(|f| f.frame_size == requested.frame_size)
            .or_else(|| formats.first())
            .map_or(requested.frame_rate, |f| f.frame_rate);
        tracing::debug!(
            "Device offers {} formats, source rate {:.2} fps",
            formats.len(),
            source_fps
        );
        self.registry.set_source_frame_rate(source_fps);

        let weak = Arc::downgrade(self);
        let registry = self.registry.clone();
        self.client.start_capture(
            CLIENT_ID,
            params,
            move |state| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_capture_state(state);
                }
            },
            move |frame, reference_time| registry.deliver_frame(&frame, reference_time),
        );
    }

    /// Main runner
    fn on_capture_state(self: &Arc<Self>, state: CaptureState) {
        tracing::debug!("Capture state {}", state);
        match state {
            CaptureState::Started => self.on_started(),
            CaptureState::Paused => self.set_tracks_ready_state(ReadyState::Muted),
            CaptureState::Resumed => self.set_tracks_ready_state(ReadyState::Live),
            CaptureState::Error => self.end(FailureCode::TransportError, "capture device error"),
            CaptureState::Ended => self.end(FailureCode::SourceEnded, "capture device ended"),
            CaptureState::Starting | CaptureState::Stopping | CaptureState::Stopped => {}
        }
    }

    fn on_started(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != SourceState::Starting {
                return;
            }
            *state = SourceState::Started;
        }
        tracing::info!("Capture started");

        for callback in std::mem::take(&mut *self.pending.lock()) {
            self.report(callback, StartOutcome::Started);
        }

        if self.monitor.enabled {
            let weak = Arc::downgrade(self);
            self.registry
                .start_frame_monitor(self.monitor.settings(), move |muted| {
                    if let Some(inner) = weak.upgrade() {
                        let state = if muted {
                            ReadyState::Muted
                        } else {
                            ReadyState::Live
                        };
                        inner.set_tracks_ready_state(state);
                    }
                });
        }
    }

    fn end(&self, code: FailureCode, name: &str) {
        {
            let mut state = self.state.lock();
            if *state == SourceState::Ended {
                return;
            }
            *state = SourceState::Ended;
        }
        tracing::warn!("Capture source ended: {} ({})", name, code);

        self.registry.stop_frame_monitor();
        for callback in std::mem::take(&mut *self.pending.lock()) {
            self.report(
                callback,
                StartOutcome::Failed {
                    code,
                    name: name.to_string(),
                },
            );
        }
        self.set_tracks_ready_state(ReadyState::Ended);
    }

    fn set_tracks_ready_state(&self, state: ReadyState) {
        let tracks: Vec<Arc<TrackShared>> = self.tracks.lock().values().cloned().collect();
        for track in tracks {
            track.set_ready_state(state);
        }
    }
}

impl TrackSource for Inner {
    fn remove_track(&self, track_id: TrackId) {
        self.registry.remove_track(track_id);
        let now_empty = {
            let mut tracks = self.tracks.lock();
            if tracks.remove(&track_id).is_none() {
                return;
            }
            tracks.is_empty()
        };
        tracing::debug!("Track {} removed", track_id);
        if !now_empty {
            return;
        }

        let mut state = self.state.lock();
        if matches!(*state, SourceState::Starting | SourceState::Started) {
            *state = SourceState::Idle;
            drop(state);
            tracing::info!("Last track gone, stopping capture");
            self.pending.lock().clear();
            self.registry.stop_frame_monitor();
            self.client.stop_capture(CLIENT_ID);
        }
    }
}

/// Capture source handing out constrained video tracks
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("session_id", &self.inner.client.session_id())
            .field("state", &self.state())
            .field("tracks", &self.track_count())
            .finish()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Open a track with `constraints`.
    ///
    /// Invalid constraints fail here, before capture is touched. Whether
    /// the source actually started is reported to `on_started` on the main
    /// runner.
    pub fn add_track(
        &self,
        constraints: ConstraintSet,
        on_started: impl FnOnce(StartOutcome) + Send + 'static,
    ) -> Result<VideoTrack> {
        constraints.validate()?;
        if self.state() == SourceState::Ended {
            return Err(Error::SourceEnded);
        }

        let inner = &self.inner;
        let track_id = inner.next_track_id.fetch_add(1, Ordering::Relaxed);
        let shared = TrackShared::new(track_id, constraints, inner.ctx.io.clone());
        let deliver = shared.clone();
        inner
            .registry
            .add_track(track_id, constraints, move |frame, reference_time| {
                deliver.deliver(frame, reference_time)
            })?;
        inner.tracks.lock().insert(track_id, shared.clone());
        tracing::debug!("Track {} added with {}", track_id, constraints);

        let on_started: StartCallback = Box::new(on_started);
        // Held across the transition so two racing adds start capture once
        let mut state = inner.state.lock();
        let current = *state;
        match current {
            SourceState::Idle => {
                *state = SourceState::Starting;
                inner.pending.lock().push(on_started);
                drop(state);
                inner.start_source();
            }
            SourceState::Starting => inner.pending.lock().push(on_started),
            SourceState::Started => {
                drop(state);
                inner.report(on_started, StartOutcome::Started);
            }
            SourceState::Ended => {
                drop(state);
                inner.report(
                    on_started,
                    StartOutcome::Failed {
                        code: FailureCode::SourceEnded,
                        name: "capture device ended".into(),
                    },
                );
            }
        }

        let source: Weak<dyn TrackSource> = Arc::downgrade(&self.inner) as Weak<Inner>;
        Ok(VideoTrack::new(shared, source))
    }

    pub fn state(&self) -> SourceState {
        *self.inner.state.lock()
    }

    pub fn track_count(&self) -> usize {
        self.inner.tracks.lock().len()
    }

    pub fn context(&self) -> &PipelineContext {
        &self.inner.ctx
    }

    /// Pause or resume the device; tracks are muted while paused
    pub fn suspend(&self, suspend: bool) {
        self.inner.client.suspend_capture(suspend);
    }

    pub fn request_refresh_frame(&self) {
        self.inner.client.request_refresh_frame();
    }

    /// Formats the device offers, answered on the main runner
    pub fn supported_formats(&self, cb: impl FnOnce(Vec<VideoCaptureFormat>) + Send + 'static) {
        self.inner.client.get_device_supported_formats(cb);
    }

    /// Capture counters merged with the registry's delivery counters
    pub fn stats(&self) -> Stats {
        let mut stats = self.inner.client.stats();
        stats.frames_delivered = self.inner.registry.frames_delivered();
        stats.frames_dropped = self.inner.registry.frames_dropped();
        stats
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.alive.cancel();
        inner.registry.shutdown();
        inner.pending.lock().clear();
        inner.set_tracks_ready_state(ReadyState::Ended);
        inner.client.stop_capture(CLIENT_ID);
    }
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    host: Option<Arc<dyn CaptureHost>>,
    context: Option<PipelineContext>,
    session_id: SessionId,
    capture: CaptureConfig,
    monitor: MonitorConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            host: None,
            context: None,
            session_id: 1,
            capture: CaptureConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }

    /// Device the pipeline captures from (required)
    pub fn host(mut self, host: Arc<dyn CaptureHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Runners to use; a fresh context is spawned otherwise
    pub fn context(mut self, ctx: PipelineContext) -> Self {
        self.context = Some(ctx);
        self
    }

    pub fn session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn capture(mut self, config: CaptureConfig) -> Self {
        self.capture = config;
        self
    }

    pub fn monitor(mut self, config: MonitorConfig) -> Self {
        self.monitor = config;
        self
    }

    pub fn preset(mut self, preset: Preset) -> Self {
        self.capture = preset.into();
        self
    }

    /// Capture and monitor sections of `config`
    pub fn config(mut self, config: &PipelineConfig) -> Self {
        self.capture = config.capture.clone();
        self.monitor = config.monitor;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let host = self
            .host
            .ok_or_else(|| Error::Config("pipeline needs a capture host".into()))?;
        self.capture.validate()?;
        self.monitor.validate()?;
        let ctx = match self.context {
            Some(ctx) => ctx,
            None => PipelineContext::new()?,
        };

        let client = VideoCaptureClient::new(self.session_id, host, ctx.clone());
        let registry = TrackAdapterRegistry::new(ctx.clone(), self.capture.framerate.as_f64());
        Ok(Pipeline {
            inner: Arc::new(Inner {
                ctx,
                client,
                registry,
                capture: self.capture,
                monitor: self.monitor,
                alive: CancellationToken::new(),
                state: Mutex::new(SourceState::Idle),
                tracks: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
                next_track_id: AtomicU64::new(1),
                start_generation: AtomicU64::new(0),
            }),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FakeCaptureHost, HostCall};
    use crate::types::{PixelFormat, Size};

    struct Fixture {
        host: Arc<FakeCaptureHost>,
        pipeline: Pipeline,
        outcomes: Arc<Mutex<Vec<StartOutcome>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let format = VideoCaptureFormat::new(Size::VGA, 0.0, PixelFormat::I420);
            let host = Arc::new(FakeCaptureHost::new(vec![format]));
            let pipeline = Pipeline::builder()
                .host(host.clone())
                .monitor(MonitorConfig {
                    enabled: false,
                    ..Default::default()
                })
                .build()
                .unwrap();
            Self {
                host,
                pipeline,
                outcomes: Arc::default(),
            }
        }

        fn track(&self, constraints: ConstraintSet) -> Result<VideoTrack> {
            let outcomes = self.outcomes.clone();
            self.pipeline
                .add_track(constraints, move |outcome| outcomes.lock().push(outcome))
        }

        fn settle(&self) {
            for _ in 0..3 {
                self.pipeline.context().sync();
            }
        }

        fn starts(&self) -> usize {
            self.host
                .calls()
                .iter()
                .filter(|c| matches!(c, HostCall::Start { .. }))
                .count()
        }
    }

    #[test]
    fn first_track_starts_capture_once() {
        let fx = Fixture::new();
        let _a = fx.track(ConstraintSet::new()).unwrap();
        let _b = fx.track(ConstraintSet::new().with_max_height(240)).unwrap();
        fx.settle();

        assert_eq!(fx.starts(), 1);
        assert_eq!(fx.pipeline.state(), SourceState::Started);
        assert_eq!(*fx.outcomes.lock(), vec![StartOutcome::Started; 2]);

        let _c = fx.track(ConstraintSet::new()).unwrap();
        fx.settle();
        assert_eq!(fx.outcomes.lock().len(), 3);
        assert_eq!(fx.starts(), 1);
    }

    #[test]
    fn stale_format_answer_does_not_restart_capture() {
        let fx = Fixture::new();
        let (release, blocked) = crossbeam_channel::unbounded::<()>();
        fx.pipeline.context().main.post(move || {
            let _ = blocked.recv();
        });

        // Both format answers queue up behind the blocked main runner
        let first = fx.track(ConstraintSet::new()).unwrap();
        drop(first);
        assert_eq!(fx.pipeline.state(), SourceState::Idle);
        let _second = fx.track(ConstraintSet::new()).unwrap();
        fx.pipeline.context().io.sync();
        release.send(()).unwrap();
        fx.settle();

        assert_eq!(fx.starts(), 1);
        assert_eq!(fx.pipeline.state(), SourceState::Started);
        assert_eq!(*fx.outcomes.lock(), vec![StartOutcome::Started]);
    }

    #[test]
    fn invalid_constraints_never_touch_capture() {
        let fx = Fixture::new();
        let err = fx
            .track(ConstraintSet::new().with_aspect_ratio(Some(2.0), Some(1.0)))
            .unwrap_err();
        assert_eq!(err.failure_code(), FailureCode::ConstraintNotSatisfied);
        assert_eq!(err.failure_name(), "min_aspect_ratio");
        fx.settle();
        assert_eq!(fx.starts(), 0);
        assert_eq!(fx.pipeline.track_count(), 0);
    }

    #[test]
    fn last_track_stop_stops_capture() {
        let fx = Fixture::new();
        let a = fx.track(ConstraintSet::new()).unwrap();
        let b = fx.track(ConstraintSet::new()).unwrap();
        fx.settle();

        a.stop();
        fx.settle();
        assert!(!fx.host.calls().iter().any(|c| matches!(c, HostCall::Stop { .. })));

        drop(b);
        fx.settle();
        assert!(fx.host.calls().iter().any(|c| matches!(c, HostCall::Stop { .. })));
        assert_eq!(fx.pipeline.state(), SourceState::Idle);
        assert_eq!(fx.pipeline.track_count(), 0);
    }

    #[test]
    fn device_error_ends_tracks_and_fails_new_ones() {
        let fx = Fixture::new();
        let track = fx.track(ConstraintSet::new()).unwrap();
        fx.settle();

        fx.host.set_state(1, CaptureState::Error);
        fx.settle();
        assert_eq!(track.ready_state(), ReadyState::Ended);
        assert_eq!(fx.pipeline.state(), SourceState::Ended);
        assert!(matches!(
            fx.track(ConstraintSet::new()),
            Err(Error::SourceEnded)
        ));
    }

    #[test]
    fn failure_before_start_reaches_the_callback() {
        let format = VideoCaptureFormat::new(Size::VGA, 30.0, PixelFormat::I420);
        let host = Arc::new(FakeCaptureHost::new(vec![format]).with_auto_ack(false));
        let pipeline = Pipeline::builder().host(host.clone()).build().unwrap();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let o = outcomes.clone();
        let _track = pipeline
            .add_track(ConstraintSet::new(), move |outcome| o.lock().push(outcome))
            .unwrap();
        for _ in 0..3 {
            pipeline.context().sync();
        }

        host.set_state(1, CaptureState::Error);
        for _ in 0..3 {
            pipeline.context().sync();
        }
        assert_eq!(
            *outcomes.lock(),
            vec![StartOutcome::Failed {
                code: FailureCode::TransportError,
                name: "capture device error".into()
            }]
        );
    }

    #[test]
    fn paused_device_mutes_tracks() {
        let fx = Fixture::new();
        let track = fx.track(ConstraintSet::new()).unwrap();
        fx.settle();

        fx.pipeline.suspend(true);
        fx.settle();
        assert_eq!(track.ready_state(), ReadyState::Muted);
        fx.pipeline.suspend(false);
        fx.settle();
        assert_eq!(track.ready_state(), ReadyState::Live);
    }

    #[test]
    fn builder_requires_a_host() {
        assert!(matches!(Pipeline::builder().build(), Err(Error::Config(_))));
    }
}
