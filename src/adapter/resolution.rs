//! One adapter per distinct constraint set
//!
//! An adapter owns the frame-rate state for its constraint set and fans
//! the adapted view out to every track sharing it.

use super::geometry::compute_geometry;
use super::{ConstraintSet, TrackCallback, TrackId};
use crate::cancel::CancellationToken;
use crate::frame::Frame;

use std::time::Duration;

/// Frames this close to the minimum interval still count as on time
const FRAME_INTERVAL_TOLERANCE: Duration = Duration::from_millis(1);
/// A gap this long restarts frame-rate accounting
const RATE_RESET_GAP: Duration = Duration::from_secs(1);

/// Why an adapter skipped a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Arrived sooner than the frame-rate cap allows
    FrameRate,
    /// Timestamp earlier than the last delivered frame
    NonMonotonic,
    /// The view could not be built
    InvalidGeometry,
}

struct TrackEntry {
    track_id: TrackId,
    callback: TrackCallback,
    token: CancellationToken,
}

/// Adapts a frame stream to one [`ConstraintSet`]
pub struct ResolutionAdapter {
    constraints: ConstraintSet,
    source_frame_rate: f64,
    last_delivered: Option<Duration>,
    tracks: Vec<TrackEntry>,
    frames_dropped: u64,
}

impl std::fmt::Debug for ResolutionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionAdapter")
            .field("constraints", &self.constraints)
            .field("tracks", &self.tracks.len())
            .field("frames_dropped", &self.frames_dropped)
            .finish()
    }
}

impl ResolutionAdapter {
    /// `source_frame_rate` is the nominal rate; 0 when unknown
    pub fn new(constraints: ConstraintSet, source_frame_rate: f64) -> Self {
        Self {
            constraints,
            source_frame_rate,
            last_delivered: None,
            tracks: Vec::new(),
            frames_dropped: 0,
        }
    }

    pub fn constraints(&self) -> &ConstraintSet {
        &self.constraints
    }

    pub fn set_source_frame_rate(&mut self, fps: f64) {
        self.source_frame_rate = fps;
    }

    pub fn add_track(&mut self, track_id: TrackId, callback: TrackCallback, token: CancellationToken) {
        debug_assert!(self.tracks.iter().all(|t| t.track_id != track_id));
        self.tracks.push(TrackEntry {
            track_id,
            callback,
            token,
        });
    }

    /// Remove `track_id`; returns whether it was present
    pub fn remove_track(&mut self, track_id: TrackId) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|t| t.track_id != track_id);
        self.tracks.len() != before
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    fn should_drop(&self, timestamp: Duration) -> Option<DropReason> {
        let last = self.last_delivered?;
        if timestamp < last {
            return Some(DropReason::NonMonotonic);
        }

        let cap = self.constraints.frame_rate_cap()?;
        if self.source_frame_rate > 0.0 && self.source_frame_rate <= cap {
            return None;
        }

        let delta = timestamp - last;
        if delta > RATE_RESET_GAP {
            return None;
        }
        let min_interval = Duration::from_secs_f64(1.0 / cap);
        (delta + FRAME_INTERVAL_TOLERANCE < min_interval).then_some(DropReason::FrameRate)
    }

    /// The frame this adapter's tracks should see, or why there is none.
    ///
    /// Frames already inside the bounds come back as the same object.
    pub fn adapt(&mut self, frame: &Frame) -> Result<Frame, DropReason> {
        let timestamp = frame.timestamp();
        if let Some(reason) = self.should_drop(timestamp) {
            self.frames_dropped += 1;
            tracing::debug!("Dropping frame at {:?}: {:?}", timestamp, reason);
            return Err(reason);
        }

        let adapted = match compute_geometry(frame.visible_rect(), frame.natural_size(), &self.constraints)
        {
            None => frame.clone(),
            Some(geometry) => frame
                .wrap(geometry.visible_rect, geometry.natural_size)
                .map_err(|e| {
                    tracing::error!("Adapted view rejected: {}", e);
                    self.frames_dropped += 1;
                    DropReason::InvalidGeometry
                })?,
        };
        self.last_delivered = Some(timestamp);
        Ok(adapted)
    }

    /// Adapt `frame` and hand it to every track; false when it was dropped
    pub fn deliver(&mut self, frame: &Frame, reference_time: Duration) -> bool {
        let adapted = match self.adapt(frame) {
            Ok(adapted) => adapted,
            Err(_) => return false,
        };
        for track in &self.tracks {
            track
                .token
                .run(|| (track.callback)(adapted.clone(), reference_time));
        }
        true
    }
}
