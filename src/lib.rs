//! trackfeed - video capture, adaptation and presentation pipeline
//!
//! Frames flow from a capture device into per-track adapters and on to a
//! wall-clock frame scheduler.
//!
//! # Features
//!
//! - **Capture**: shared-memory buffer lifecycle against a remote device,
//!   with exactly one release per delivered buffer
//! - **Adapt**: per-track resolution, aspect ratio and frame-rate
//!   constraints, delivered as zero-copy views
//! - **Tracks**: sinks, enable/disable with black frames, muted detection
//! - **Schedule**: bounded ready queue, late-frame dropping, underflow and
//!   end-of-stream handling on a dedicated presentation thread
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trackfeed::{capture::FakeCaptureHost, ConstraintSet, Pipeline, Size, VideoCaptureFormat};
//!
//! fn main() -> trackfeed::Result<()> {
//!     let format = VideoCaptureFormat::new(Size::HD_720P, 30.0, trackfeed::PixelFormat::I420);
//!     let pipeline = Pipeline::builder()
//!         .host(Arc::new(FakeCaptureHost::producing(format)))
//!         .build()?;
//!
//!     let track = pipeline.add_track(ConstraintSet::new().with_max_height(360), |outcome| {
//!         println!("track start: {outcome:?}");
//!     })?;
//!     println!("{track:?}");
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod cancel;
pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod scheduler;
pub mod task;
pub mod track;
pub mod types;

// Re-exports for convenience
pub use adapter::{ConstraintSet, TrackAdapterRegistry, TrackId};
pub use capture::{CaptureHost, CaptureState, VideoCaptureClient};
pub use config::{PipelineConfig, Preset};
pub use error::{Error, FailureCode, Result};
pub use frame::Frame;
pub use pipeline::{Pipeline, PipelineBuilder, SourceState, StartOutcome};
pub use scheduler::{FrameScheduler, RendererClient, TrackFrameStream, WallClockTimeSource};
pub use task::{PipelineContext, TaskRunner};
pub use track::{ReadyState, VideoSink, VideoTrack};
pub use types::{PixelFormat, Rect, Size, VideoCaptureFormat};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
