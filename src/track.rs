//! Video tracks and their sinks
//!
//! A `VideoTrack` is the consumer-facing handle for one adapted frame
//! stream. Frames reach it on the I/O runner and are passed straight to
//! its sinks. A disabled track keeps the stream flowing but substitutes
//! black frames of the same size and timing.

use crate::adapter::{ConstraintSet, TrackId};
use crate::cancel::CancellationToken;
use crate::frame::Frame;
use crate::task::TaskRunner;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Lifecycle of a track as seen by its consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// Frames are flowing
    Live,
    /// The source has stopped producing for now
    Muted,
    /// The track will never produce again
    Ended,
}

/// Consumer of a track's frames
pub trait VideoSink: Send + Sync {
    /// Called on the I/O runner; must not block
    fn on_frame(&self, frame: Frame, reference_time: Duration);

    fn on_enabled_changed(&self, _enabled: bool) {}

    fn on_ready_state_changed(&self, _state: ReadyState) {}
}

/// Identifies a sink on one track
pub type SinkId = u64;

/// What a track calls back into when it is stopped
pub trait TrackSource: Send + Sync {
    fn remove_track(&self, track_id: TrackId);
}

struct SinkEntry {
    id: SinkId,
    sink: Arc<dyn VideoSink>,
    token: CancellationToken,
}

/// State shared by a track handle, its source and the delivery path
pub(crate) struct TrackShared {
    id: TrackId,
    constraints: ConstraintSet,
    io: TaskRunner,
    enabled: AtomicBool,
    ready_state: Mutex<ReadyState>,
    sinks: Mutex<Vec<SinkEntry>>,
    next_sink_id: AtomicU64,
    black_frame: Mutex<Option<Frame>>,
    frames_received: AtomicU64,
}

impl TrackShared {
    pub(crate) fn new(id: TrackId, constraints: ConstraintSet, io: TaskRunner) -> Arc<Self> {
        Arc::new(Self {
            id,
            constraints,
            io,
            enabled: AtomicBool::new(true),
            ready_state: Mutex::new(ReadyState::Live),
            sinks: Mutex::new(Vec::new()),
            next_sink_id: AtomicU64::new(1),
            black_frame: Mutex::new(None),
            frames_received: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> TrackId {
        self.id
    }

    /// Hand `frame` to every sink. Runs on the I/O runner.
    pub(crate) fn deliver(&self, frame: Frame, reference_time: Duration) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = if self.enabled.load(Ordering::Acquire) {
            frame
        } else {
            match self.black_frame_like(&frame) {
                Some(black) => black,
                None => return,
            }
        };

        let targets: Vec<(Arc<dyn VideoSink>, CancellationToken)> = self
            .sinks
            .lock()
            .iter()
            .map(|e| (e.sink.clone(), e.token.clone()))
            .collect();
        for (sink, token) in targets {
            token.run(|| sink.on_frame(frame.clone(), reference_time));
        }
    }

    fn black_frame_like(&self, frame: &Frame) -> Option<Frame> {
        let size = frame.natural_size();
        let mut cached = self.black_frame.lock();
        let black = match cached.as_ref() {
            Some(black) if black.coded_size() == size => black.clone(),
            _ => {
                let black = Frame::black(size, frame.timestamp());
                *cached = Some(black.clone());
                black
            }
        };
        black
            .with_timestamp(frame.timestamp())
            .map_err(|e| tracing::warn!("Track {}: no black frame: {}", self.id, e))
            .ok()
    }

    /// Move to `state` and tell the sinks. Ended is final.
    pub(crate) fn set_ready_state(&self, state: ReadyState) {
        {
            let mut current = self.ready_state.lock();
            if *current == state || *current == ReadyState::Ended {
                return;
            }
            *current = state;
        }
        tracing::debug!("Track {} is now {:?}", self.id, state);
        let sinks: Vec<Arc<dyn VideoSink>> =
            self.sinks.lock().iter().map(|e| e.sink.clone()).collect();
        for sink in sinks {
            sink.on_ready_state_changed(state);
        }
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        *self.ready_state.lock()
    }
}

/// Consumer handle for one constrained frame stream
pub struct VideoTrack {
    shared: Arc<TrackShared>,
    source: Weak<dyn TrackSource>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for VideoTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoTrack")
            .field("id", &self.shared.id)
            .field("ready_state", &self.ready_state())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl VideoTrack {
    pub(crate) fn new(shared: Arc<TrackShared>, source: Weak<dyn TrackSource>) -> Self {
        Self {
            shared,
            source,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TrackId {
        self.shared.id
    }

    pub fn constraints(&self) -> &ConstraintSet {
        &self.shared.constraints
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.ready_state()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Frames that reached this track, black substitutes included
    pub fn frames_received(&self) -> u64 {
        self.shared.frames_received.load(Ordering::Relaxed)
    }

    /// Disabled tracks deliver black frames in place of real ones
    pub fn set_enabled(&self, enabled: bool) {
        if self.shared.enabled.swap(enabled, Ordering::AcqRel) == enabled {
            return;
        }
        let sinks: Vec<Arc<dyn VideoSink>> =
            self.shared.sinks.lock().iter().map(|e| e.sink.clone()).collect();
        for sink in sinks {
            sink.on_enabled_changed(enabled);
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn VideoSink>) -> SinkId {
        let id = self.shared.next_sink_id.fetch_add(1, Ordering::Relaxed);
        self.shared.sinks.lock().push(SinkEntry {
            id,
            sink,
            token: CancellationToken::new(),
        });
        id
    }

    /// Detach a sink; it sees no frame after this returns
    pub fn remove_sink(&self, sink_id: SinkId) -> bool {
        let removed = {
            let mut sinks = self.shared.sinks.lock();
            sinks
                .iter()
                .position(|e| e.id == sink_id)
                .map(|index| sinks.remove(index))
        };
        let Some(entry) = removed else {
            return false;
        };
        if self.shared.io.runs_tasks_on_current_thread() {
            entry.token.cancel();
        } else {
            entry.token.cancel_and_wait();
        }
        true
    }

    pub fn sink_count(&self) -> usize {
        self.shared.sinks.lock().len()
    }

    /// End the track and unregister it from its source. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(source) = self.source.upgrade() {
            source.remove_track(self.shared.id);
        }
        self.shared.set_ready_state(ReadyState::Ended);
    }
}

impl Drop for VideoTrack {
    fn drop(&mut self) {
        self.stop();
    }
}
