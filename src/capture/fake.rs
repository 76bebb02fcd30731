//! In-process capture device
//!
//! Two modes:
//! - manual: records every command and lets the caller inject events;
//!   start/stop/pause/resume are acknowledged automatically unless
//!   disabled with [`FakeCaptureHost::with_auto_ack`]
//! - producer: a thread paints I420 frames at the nominal rate into a
//!   small pool of shared-memory buffers, reusing a buffer only after the
//!   client released it

use super::{
    BufferId, CaptureEvent, CaptureEventSink, CaptureHost, CaptureParams, CaptureState, FrameInfo,
    SessionId, SharedMemoryHandle,
};
use crate::error::{Error, Result};
use crate::types::{PixelFormat, SyncToken, VideoCaptureFormat};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Buffers kept in flight by the producer
const POOL_SIZE: usize = 3;
/// Rate used when the device does not know its own
const FALLBACK_FPS: f64 = 30.0;
/// How long a stopped producer waits for outstanding releases
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A command received by the fake device
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    Start {
        session_id: SessionId,
        params: CaptureParams,
    },
    Stop {
        session_id: SessionId,
    },
    Pause {
        session_id: SessionId,
    },
    Resume {
        session_id: SessionId,
    },
    RefreshFrame {
        session_id: SessionId,
    },
    Release {
        session_id: SessionId,
        buffer_id: BufferId,
        sync_token: SyncToken,
        utilization: f64,
    },
}

struct Producer {
    running: Arc<AtomicBool>,
    released_tx: Sender<BufferId>,
    format: VideoCaptureFormat,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<HostCall>,
    sinks: HashMap<SessionId, CaptureEventSink>,
    producers: HashMap<SessionId, Producer>,
}

/// Capture device living in the same process
pub struct FakeCaptureHost {
    formats: Vec<VideoCaptureFormat>,
    produce: bool,
    auto_ack: bool,
    frames_produced: Arc<AtomicU64>,
    state: Mutex<FakeState>,
}

impl std::fmt::Debug for FakeCaptureHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeCaptureHost")
            .field("formats", &self.formats)
            .field("produce", &self.produce)
            .field("auto_ack", &self.auto_ack)
            .finish()
    }
}

impl FakeCaptureHost {
    /// Manual device reporting `formats`
    pub fn new(formats: Vec<VideoCaptureFormat>) -> Self {
        Self {
            formats,
            produce: false,
            auto_ack: true,
            frames_produced: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Device that paints frames in `format` once started
    pub fn producing(format: VideoCaptureFormat) -> Self {
        let mut host = Self::new(vec![format]);
        host.produce = true;
        host
    }

    /// Acknowledge start/stop/pause/resume with state events
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Every command received so far
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    /// `(buffer, sync token, utilization)` for every release received
    pub fn released(&self) -> Vec<(BufferId, SyncToken, f64)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                HostCall::Release {
                    buffer_id,
                    sync_token,
                    utilization,
                    ..
                } => Some((*buffer_id, *sync_token, *utilization)),
                _ => None,
            })
            .collect()
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced.load(Ordering::Relaxed)
    }

    /// Event sink of `session_id`, if it was ever started
    pub fn sink(&self, session_id: SessionId) -> Option<CaptureEventSink> {
        self.state.lock().sinks.get(&session_id).cloned()
    }

    /// Inject `event` into `session_id`
    pub fn send(&self, session_id: SessionId, event: CaptureEvent) -> bool {
        match self.sink(session_id) {
            Some(sink) => sink.send(event),
            None => false,
        }
    }

    /// Allocate a buffer and announce it; returns the producer-side handle
    pub fn create_buffer(
        &self,
        session_id: SessionId,
        buffer_id: BufferId,
        size: usize,
    ) -> SharedMemoryHandle {
        let handle = SharedMemoryHandle::allocate(size);
        self.send(
            session_id,
            CaptureEvent::BufferCreated {
                buffer_id,
                handle: handle.clone(),
                size,
            },
        );
        handle
    }

    pub fn ready(&self, session_id: SessionId, buffer_id: BufferId, info: FrameInfo) -> bool {
        self.send(session_id, CaptureEvent::BufferReady { buffer_id, info })
    }

    pub fn destroy(&self, session_id: SessionId, buffer_id: BufferId) -> bool {
        self.send(session_id, CaptureEvent::BufferDestroyed { buffer_id })
    }

    pub fn set_state(&self, session_id: SessionId, state: CaptureState) -> bool {
        self.send(session_id, CaptureEvent::StateChanged(state))
    }

    fn ack(&self, session_id: SessionId, state: CaptureState) {
        if self.auto_ack {
            self.set_state(session_id, state);
        }
    }

    fn spawn_producer(&self, session_id: SessionId, params: &CaptureParams, sink: CaptureEventSink) -> Result<Producer> {
        let mut format = self
            .formats
            .first()
            .copied()
            .unwrap_or(params.requested_format);
        if format.frame_size.is_empty() {
            format.frame_size = params.requested_format.frame_size;
        }
        format.pixel_format = PixelFormat::I420;

        let running = Arc::new(AtomicBool::new(true));
        let (released_tx, released_rx) = crossbeam_channel::unbounded();

        let worker = ProducerLoop {
            format,
            sink,
            running: running.clone(),
            released_rx,
            frames_produced: self.frames_produced.clone(),
        };
        std::thread::Builder::new()
            .name(format!("fake-capture-{session_id}"))
            .spawn(move || worker.run())
            .map_err(|e| Error::Transport(format!("failed to spawn producer: {e}")))?;

        Ok(Producer {
            running,
            released_tx,
            format,
        })
    }
}

impl Drop for FakeCaptureHost {
    fn drop(&mut self) {
        for producer in self.state.get_mut().producers.values() {
            producer.running.store(false, Ordering::SeqCst);
        }
    }
}

impl CaptureHost for FakeCaptureHost {
    fn start(&self, session_id: SessionId, params: &CaptureParams, events: CaptureEventSink) {
        tracing::debug!(
            "Fake device starting session {} at {}",
            session_id,
            params.requested_format
        );
        {
            let mut state = self.state.lock();
            state.calls.push(HostCall::Start {
                session_id,
                params: *params,
            });
            state.sinks.insert(session_id, events.clone());
        }

        if !self.produce {
            self.ack(session_id, CaptureState::Started);
            return;
        }

        match self.spawn_producer(session_id, params, events.clone()) {
            Ok(producer) => {
                self.state.lock().producers.insert(session_id, producer);
            }
            Err(e) => {
                tracing::error!("{}", e);
                events.send(CaptureEvent::StateChanged(CaptureState::Error));
            }
        }
    }

    fn stop(&self, session_id: SessionId) {
        let producer = {
            let mut state = self.state.lock();
            state.calls.push(HostCall::Stop { session_id });
            state.producers.remove(&session_id)
        };
        match producer {
            // The producer thread reports Stopped once its free buffers are gone
            Some(producer) => producer.running.store(false, Ordering::SeqCst),
            None => self.ack(session_id, CaptureState::Stopped),
        }
    }

    fn pause(&self, session_id: SessionId) {
        self.state.lock().calls.push(HostCall::Pause { session_id });
        self.ack(session_id, CaptureState::Paused);
    }

    fn resume(&self, session_id: SessionId) {
        self.state.lock().calls.push(HostCall::Resume { session_id });
        self.ack(session_id, CaptureState::Resumed);
    }

    fn request_refresh_frame(&self, session_id: SessionId) {
        self.state
            .lock()
            .calls
            .push(HostCall::RefreshFrame { session_id });
    }

    fn release_buffer(
        &self,
        session_id: SessionId,
        buffer_id: BufferId,
        sync_token: SyncToken,
        resource_utilization: f64,
    ) {
        let mut state = self.state.lock();
        state.calls.push(HostCall::Release {
            session_id,
            buffer_id,
            sync_token,
            utilization: resource_utilization,
        });
        if let Some(producer) = state.producers.get(&session_id) {
            let _ = producer.released_tx.send(buffer_id);
        }
    }

    fn supported_formats(&self, _session_id: SessionId) -> Result<Vec<VideoCaptureFormat>> {
        Ok(self.formats.clone())
    }

    fn formats_in_use(&self, session_id: SessionId) -> Result<Vec<VideoCaptureFormat>> {
        Ok(self
            .state
            .lock()
            .producers
            .get(&session_id)
            .map(|p| vec![p.format])
            .unwrap_or_default())
    }
}

struct ProducerLoop {
    format: VideoCaptureFormat,
    sink: CaptureEventSink,
    running: Arc<AtomicBool>,
    released_rx: Receiver<BufferId>,
    frames_produced: Arc<AtomicU64>,
}

impl ProducerLoop {
    fn run(self) {
        let fps = if self.format.frame_rate > 0.0 {
            self.format.frame_rate
        } else {
            FALLBACK_FPS
        };
        let interval = Duration::from_secs_f64(1.0 / fps);
        let size = self.format.pixel_format.allocation_size(self.format.frame_size);

        self.sink
            .send(CaptureEvent::StateChanged(CaptureState::Started));

        let mut pool: HashMap<BufferId, SharedMemoryHandle> = HashMap::new();
        let mut free: Vec<BufferId> = Vec::new();
        let mut next_id: BufferId = 0;
        let mut index: u64 = 0;
        let epoch = Instant::now();
        let mut next_tick = epoch;

        while self.running.load(Ordering::SeqCst) && !self.sink.is_closed() {
            free.extend(self.released_rx.try_iter());

            let buffer_id = match free.pop() {
                Some(id) => Some(id),
                None if pool.len() < POOL_SIZE => {
                    next_id += 1;
                    let handle = SharedMemoryHandle::allocate(size);
                    self.sink.send(CaptureEvent::BufferCreated {
                        buffer_id: next_id,
                        handle: handle.clone(),
                        size,
                    });
                    pool.insert(next_id, handle);
                    Some(next_id)
                }
                None => None,
            };

            match buffer_id.and_then(|id| pool.get(&id).map(|h| (id, h))) {
                Some((id, handle)) => {
                    paint(handle, self.format, index);
                    let elapsed = epoch.elapsed();
                    let mut info = FrameInfo::new(
                        PixelFormat::I420,
                        self.format.frame_size,
                        interval * index as u32,
                    );
                    info.reference_time = elapsed;
                    self.sink.send(CaptureEvent::BufferReady { buffer_id: id, info });
                    self.frames_produced.fetch_add(1, Ordering::Relaxed);
                }
                None => tracing::trace!("Fake device pool exhausted, skipping frame {}", index),
            }
            index += 1;

            next_tick += interval;
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            } else {
                next_tick = now;
            }
        }

        // Free buffers go now; outstanding ones as they come back
        free.extend(self.released_rx.try_iter());
        for id in free.drain(..) {
            pool.remove(&id);
            self.sink.send(CaptureEvent::BufferDestroyed { buffer_id: id });
        }
        self.sink
            .send(CaptureEvent::StateChanged(CaptureState::Stopped));

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !pool.is_empty() {
            match self
                .released_rx
                .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            {
                Ok(id) => {
                    pool.remove(&id);
                    self.sink.send(CaptureEvent::BufferDestroyed { buffer_id: id });
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("Fake device producer exiting after {} frames", index);
    }
}

/// Paint a moving luma ramp so consecutive frames differ
fn paint(handle: &SharedMemoryHandle, format: VideoCaptureFormat, index: u64) {
    let planes = PixelFormat::I420.plane_layout(format.frame_size);
    let mut bytes = handle.write();
    if let Some(luma) = planes.first() {
        for row in 0..luma.rows {
            let start = luma.offset + row * luma.stride;
            let value = ((row as u64 + index) % 220 + 16) as u8;
            if let Some(line) = bytes.get_mut(start..start + luma.stride) {
                line.fill(value);
            }
        }
    }
    for chroma in planes.iter().skip(1) {
        if let Some(plane) = bytes.get_mut(chroma.offset..chroma.offset + chroma.len()) {
            plane.fill(0x80);
        }
    }
}
