//! Per-track frame adaptation
//!
//! Tracks register a [`ConstraintSet`] with the [`TrackAdapterRegistry`].
//! Tracks with equal constraints share one [`ResolutionAdapter`], which
//! crops each frame (as a view, never a copy) and enforces the frame-rate
//! cap before handing it to the tracks.

mod constraints;
pub mod geometry;
mod monitor;
mod registry;
mod resolution;

pub use constraints::ConstraintSet;
pub use geometry::{center_crop, compute_geometry, AdaptedGeometry};
pub use monitor::{
    frame_interval, FrameMonitor, MonitorSettings, MutedCallback, DEFAULT_FRAME_RATE,
    FIRST_FRAME_TIMEOUT_INTERVALS, NORMAL_TIMEOUT_INTERVALS,
};
pub use registry::TrackAdapterRegistry;
pub use resolution::{DropReason, ResolutionAdapter};

use crate::frame::Frame;

use std::sync::Arc;
use std::time::Duration;

/// Identifies a track within a registry
pub type TrackId = u64;

/// Receives `(frame, reference_time)` on the I/O runner; must not block
pub type TrackCallback = Arc<dyn Fn(Frame, Duration) + Send + Sync>;
