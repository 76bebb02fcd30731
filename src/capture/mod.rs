//! Capture module
//!
//! Talks to a capture device over a command/event protocol:
//! - commands go out through the [`CaptureHost`] trait
//! - events come back through a [`CaptureEventSink`] onto the I/O runner
//! - [`VideoCaptureClient`] maps the device's shared-memory buffers and
//!   fans frames out to registered clients

mod buffer;
mod client;
mod fake;

pub use buffer::{ClientBuffer, MappedRegion, SharedMemoryHandle};
pub use client::{DeliverCallback, SessionPhase, StateCallback, VideoCaptureClient};
pub use fake::{FakeCaptureHost, HostCall};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::task::TaskRunner;
use crate::types::{PixelFormat, Rect, Size, StorageType, SyncToken, VideoCaptureFormat};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Identifies one capture session with the device
pub type SessionId = u32;
/// Identifies a shared-memory buffer within a session
pub type BufferId = u32;
/// Identifies a client registered with a [`VideoCaptureClient`]
pub type ClientId = u64;

/// Upper bound on requested capture rates
pub const MAX_FRAMES_PER_SECOND: f64 = 1000.0;

/// Formats the client accepts in `BufferReady`
pub const SUPPORTED_PIXEL_FORMATS: [PixelFormat; 4] = [
    PixelFormat::I420,
    PixelFormat::Nv12,
    PixelFormat::Argb,
    PixelFormat::Y16,
];

/// How the device may change resolution mid-session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionChangePolicy {
    /// Always deliver the requested size
    #[default]
    FixedResolution,
    /// Any size with the requested aspect ratio
    FixedAspectRatio,
    /// Any size up to the requested one
    AnyWithinLimit,
}

/// Parameters of a capture request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureParams {
    pub requested_format: VideoCaptureFormat,
    pub resolution_change_policy: ResolutionChangePolicy,
}

impl CaptureParams {
    pub fn new(frame_size: Size, frame_rate: f64) -> Self {
        Self {
            requested_format: VideoCaptureFormat::new(frame_size, frame_rate, PixelFormat::I420),
            resolution_change_policy: ResolutionChangePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ResolutionChangePolicy) -> Self {
        self.resolution_change_policy = policy;
        self
    }
}

/// State updates reported by the device and forwarded to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureState {
    Starting,
    Started,
    Paused,
    Resumed,
    Stopping,
    Stopped,
    /// Transport failure; the session is finished
    Error,
    /// The device went away; the session is finished
    Ended,
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CaptureState::Starting => "starting",
            CaptureState::Started => "started",
            CaptureState::Paused => "paused",
            CaptureState::Resumed => "resumed",
            CaptureState::Stopping => "stopping",
            CaptureState::Stopped => "stopped",
            CaptureState::Error => "error",
            CaptureState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Description of the frame the device wrote into a buffer
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub pixel_format: PixelFormat,
    pub storage_type: StorageType,
    pub coded_size: Size,
    pub visible_rect: Rect,
    /// Media timestamp; zero asks the client to estimate it
    pub timestamp: Duration,
    /// Capture time on the device clock
    pub reference_time: Duration,
    pub metadata: BTreeMap<String, String>,
}

impl FrameInfo {
    /// Info for a tightly packed shared-memory frame
    pub fn new(pixel_format: PixelFormat, coded_size: Size, timestamp: Duration) -> Self {
        Self {
            pixel_format,
            storage_type: StorageType::SharedMemory,
            coded_size,
            visible_rect: Rect::from_size(coded_size),
            timestamp,
            reference_time: timestamp,
            metadata: BTreeMap::new(),
        }
    }
}

/// Events the device sends back to the client
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    BufferCreated {
        buffer_id: BufferId,
        handle: SharedMemoryHandle,
        size: usize,
    },
    BufferReady {
        buffer_id: BufferId,
        info: FrameInfo,
    },
    BufferDestroyed {
        buffer_id: BufferId,
    },
    StateChanged(CaptureState),
}

/// Cloneable channel end the device uses to deliver events.
///
/// Events are posted onto the I/O runner; once the owning client is gone
/// they are dropped.
#[derive(Clone)]
pub struct CaptureEventSink {
    io: TaskRunner,
    token: CancellationToken,
    handler: Arc<dyn Fn(CaptureEvent) + Send + Sync>,
}

impl std::fmt::Debug for CaptureEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEventSink")
            .field("io", &self.io)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl CaptureEventSink {
    pub fn new(
        io: TaskRunner,
        token: CancellationToken,
        handler: impl Fn(CaptureEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            io,
            token,
            handler: Arc::new(handler),
        }
    }

    /// Queue `event` for the client; false once the receiver is gone
    pub fn send(&self, event: CaptureEvent) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let handler = self.handler.clone();
        self.io.post(self.token.bind(move || handler(event)))
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Commands sent to a capture device
pub trait CaptureHost: Send + Sync {
    /// Start `session_id`; the device reports progress through `events`
    fn start(&self, session_id: SessionId, params: &CaptureParams, events: CaptureEventSink);

    fn stop(&self, session_id: SessionId);

    fn pause(&self, session_id: SessionId);

    fn resume(&self, session_id: SessionId);

    /// Ask the device to resend its most recent frame
    fn request_refresh_frame(&self, session_id: SessionId);

    /// Hand a buffer back for reuse
    fn release_buffer(
        &self,
        session_id: SessionId,
        buffer_id: BufferId,
        sync_token: SyncToken,
        resource_utilization: f64,
    );

    /// Formats the device can produce
    fn supported_formats(&self, session_id: SessionId) -> Result<Vec<VideoCaptureFormat>>;

    /// Formats the device is currently producing
    fn formats_in_use(&self, session_id: SessionId) -> Result<Vec<VideoCaptureFormat>>;
}

/// Is `format` stored the way the client can map it?
pub fn is_supported(format: PixelFormat, storage: StorageType) -> bool {
    storage == StorageType::SharedMemory && SUPPORTED_PIXEL_FORMATS.contains(&format)
}
