//! Capture client for one device session
//!
//! All session state lives behind one mutex and is only mutated by tasks
//! running on the I/O runner. Public methods may be called from any
//! thread; they post to the I/O runner and return.

use super::{
    is_supported, BufferId, CaptureEvent, CaptureEventSink, CaptureHost, CaptureParams,
    CaptureState, ClientBuffer, ClientId, FrameInfo, SessionId, SharedMemoryHandle,
    MAX_FRAMES_PER_SECOND,
};
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameBacking, FrameDescriptor, FrameMetadata, ReleaseInfo};
use crate::task::PipelineContext;
use crate::types::{Size, Stats, StorageType, SyncToken, VideoCaptureFormat};

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receives session state updates on the main runner
pub type StateCallback = Arc<dyn Fn(CaptureState) + Send + Sync>;
/// Receives `(frame, reference_time)` on the I/O runner; must not block
pub type DeliverCallback = Arc<dyn Fn(Frame, Duration) + Send + Sync>;

/// Phase of the device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Stopped,
    Starting,
    Started,
    Stopping,
    /// Transport failure; terminal
    Error,
    /// Device gone; terminal
    Ended,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Error | SessionPhase::Ended)
    }

    fn as_state(&self) -> CaptureState {
        match self {
            SessionPhase::Stopped => CaptureState::Stopped,
            SessionPhase::Starting => CaptureState::Starting,
            SessionPhase::Started => CaptureState::Started,
            SessionPhase::Stopping => CaptureState::Stopping,
            SessionPhase::Error => CaptureState::Error,
            SessionPhase::Ended => CaptureState::Ended,
        }
    }
}

struct ClientInfo {
    params: CaptureParams,
    state_cb: StateCallback,
    deliver_cb: DeliverCallback,
    token: CancellationToken,
}

struct Session {
    phase: SessionPhase,
    suspended: bool,
    params: CaptureParams,
    clients: HashMap<ClientId, ClientInfo>,
    pending_on_restart: HashMap<ClientId, ClientInfo>,
    buffers: HashMap<BufferId, Arc<ClientBuffer>>,
    first_reference_time: Option<Duration>,
    stats: Stats,
}

struct Shared {
    session_id: SessionId,
    host: Arc<dyn CaptureHost>,
    ctx: PipelineContext,
    alive: CancellationToken,
    /// Delivery tokens, reachable from any thread so stop can cancel them
    tokens: Mutex<HashMap<ClientId, CancellationToken>>,
    released: Arc<AtomicU64>,
    session: Mutex<Session>,
}

/// Client side of one capture session
pub struct VideoCaptureClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for VideoCaptureClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoCaptureClient")
            .field("session_id", &self.shared.session_id)
            .field("phase", &self.phase())
            .finish()
    }
}

fn clamp_params(mut params: CaptureParams) -> CaptureParams {
    let rate = params.requested_format.frame_rate;
    params.requested_format.frame_rate = if rate.is_finite() {
        rate.clamp(0.0, MAX_FRAMES_PER_SECOND)
    } else {
        0.0
    };
    params
}

impl VideoCaptureClient {
    pub fn new(session_id: SessionId, host: Arc<dyn CaptureHost>, ctx: PipelineContext) -> Self {
        let session = Session {
            phase: SessionPhase::Stopped,
            suspended: false,
            params: CaptureParams::new(Size::default(), 0.0),
            clients: HashMap::new(),
            pending_on_restart: HashMap::new(),
            buffers: HashMap::new(),
            first_reference_time: None,
            stats: Stats::default(),
        };

        Self {
            shared: Arc::new(Shared {
                session_id,
                host,
                ctx,
                alive: CancellationToken::new(),
                tokens: Mutex::new(HashMap::new()),
                released: Arc::new(AtomicU64::new(0)),
                session: Mutex::new(session),
            }),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    /// Register `client_id` and start the device if it is the first client
    pub fn start_capture(
        &self,
        client_id: ClientId,
        params: CaptureParams,
        state_cb: impl Fn(CaptureState) + Send + Sync + 'static,
        deliver_cb: impl Fn(Frame, Duration) + Send + Sync + 'static,
    ) {
        let token = {
            let mut tokens = self.shared.tokens.lock();
            let token = tokens.entry(client_id).or_default();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };

        let client = ClientInfo {
            params: clamp_params(params),
            state_cb: Arc::new(state_cb),
            deliver_cb: Arc::new(deliver_cb),
            token,
        };

        let shared = self.shared.clone();
        self.shared.ctx.io.post(
            self.shared
                .alive
                .bind(move || shared.start_capture(client_id, client)),
        );
    }

    /// Unregister `client_id`.
    ///
    /// No frame is delivered to the client once this returns. A second call
    /// for the same client does nothing.
    pub fn stop_capture(&self, client_id: ClientId) {
        let Some(token) = self.shared.tokens.lock().remove(&client_id) else {
            tracing::debug!("stop_capture for unknown client {}", client_id);
            return;
        };

        if self.shared.ctx.io.runs_tasks_on_current_thread() {
            token.cancel();
        } else {
            token.cancel_and_wait();
        }

        let shared = self.shared.clone();
        self.shared
            .ctx
            .io
            .post(self.shared.alive.bind(move || shared.stop_capture(client_id)));
    }

    /// Pause or resume the device without tearing the session down
    pub fn suspend_capture(&self, suspend: bool) {
        let shared = self.shared.clone();
        self.shared
            .ctx
            .io
            .post(self.shared.alive.bind(move || shared.suspend_capture(suspend)));
    }

    pub fn request_refresh_frame(&self) {
        let shared = self.shared.clone();
        self.shared.ctx.io.post(self.shared.alive.bind(move || {
            if shared.session.lock().phase == SessionPhase::Started {
                shared.host.request_refresh_frame(shared.session_id);
            }
        }));
    }

    /// Answer `cb` on the main runner with the device's supported formats
    pub fn get_device_supported_formats(
        &self,
        cb: impl FnOnce(Vec<VideoCaptureFormat>) + Send + 'static,
    ) {
        self.query_formats(cb, |host, session_id| host.supported_formats(session_id));
    }

    /// Answer `cb` on the main runner with the formats currently produced
    pub fn get_device_formats_in_use(&self, cb: impl FnOnce(Vec<VideoCaptureFormat>) + Send + 'static) {
        self.query_formats(cb, |host, session_id| host.formats_in_use(session_id));
    }

    fn query_formats(
        &self,
        cb: impl FnOnce(Vec<VideoCaptureFormat>) + Send + 'static,
        query: impl FnOnce(&dyn CaptureHost, SessionId) -> Result<Vec<VideoCaptureFormat>> + Send + 'static,
    ) {
        let shared = self.shared.clone();
        self.shared.ctx.io.post(self.shared.alive.bind(move || {
            let formats = query(shared.host.as_ref(), shared.session_id).unwrap_or_else(|e| {
                tracing::warn!("Format query for session {} failed: {}", shared.session_id, e);
                Vec::new()
            });
            shared
                .ctx
                .main
                .post(shared.alive.bind(move || cb(formats)));
        }));
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.session.lock().phase
    }

    pub fn client_count(&self) -> usize {
        let session = self.shared.session.lock();
        session.clients.len() + session.pending_on_restart.len()
    }

    /// Number of mapped buffers currently in the buffer map
    pub fn buffer_count(&self) -> usize {
        self.shared.session.lock().buffers.len()
    }

    pub fn stats(&self) -> Stats {
        let mut stats = self.shared.session.lock().stats.clone();
        stats.buffers_released = self.shared.released.load(Ordering::Relaxed);
        stats
    }
}

impl Drop for VideoCaptureClient {
    fn drop(&mut self) {
        self.shared.alive.cancel();
        for (_, token) in self.shared.tokens.lock().drain() {
            token.cancel();
        }
        let phase = self.shared.session.lock().phase;
        if matches!(phase, SessionPhase::Starting | SessionPhase::Started) {
            self.shared.host.stop(self.shared.session_id);
        }
    }
}

// Everything below runs on the I/O runner
impl Shared {
    fn notify(&self, client: &ClientInfo, state: CaptureState) {
        let cb = client.state_cb.clone();
        self.ctx.main.post(self.alive.bind(move || cb(state)));
    }

    fn notify_all(&self, session: &Session, state: CaptureState) {
        for client in session.clients.values() {
            self.notify(client, state);
        }
    }

    fn event_sink(self: &Arc<Self>) -> CaptureEventSink {
        let weak = Arc::downgrade(self);
        CaptureEventSink::new(self.ctx.io.clone(), self.alive.clone(), move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_event(event);
            }
        })
    }

    fn handle_event(self: &Arc<Self>, event: CaptureEvent) {
        match event {
            CaptureEvent::BufferCreated {
                buffer_id,
                handle,
                size,
            } => self.on_buffer_created(buffer_id, handle, size),
            CaptureEvent::BufferReady { buffer_id, info } => self.on_buffer_ready(buffer_id, info),
            CaptureEvent::BufferDestroyed { buffer_id } => self.on_buffer_destroyed(buffer_id),
            CaptureEvent::StateChanged(state) => self.on_state_changed(state),
        }
    }

    /// Move to Starting and return the params to send to the device
    fn begin_start(&self, session: &mut Session) -> CaptureParams {
        session.phase = SessionPhase::Starting;
        session.suspended = false;
        session.first_reference_time = None;
        self.notify_all(session, CaptureState::Starting);
        tracing::info!(
            "Starting capture session {} at {}",
            self.session_id,
            session.params.requested_format
        );
        session.params
    }

    fn start_capture(self: &Arc<Self>, client_id: ClientId, client: ClientInfo) {
        let mut session = self.session.lock();

        if session.clients.contains_key(&client_id)
            || session.pending_on_restart.contains_key(&client_id)
        {
            tracing::error!("Client {} is already registered", client_id);
            self.notify(&client, CaptureState::Error);
            debug_assert!(false, "client {client_id} registered twice");
            return;
        }

        match session.phase {
            SessionPhase::Error | SessionPhase::Ended => {
                tracing::warn!(
                    "Client {} joined finished session {}",
                    client_id,
                    self.session_id
                );
                self.notify(&client, session.phase.as_state());
            }
            SessionPhase::Starting | SessionPhase::Started => {
                let running = session.params.resolution_change_policy;
                if client.params.resolution_change_policy != running {
                    tracing::error!(
                        "Client {} requested {:?} but session runs {:?}",
                        client_id,
                        client.params.resolution_change_policy,
                        running
                    );
                    self.notify(&client, CaptureState::Error);
                    debug_assert!(false, "resolution change policy mismatch");
                    return;
                }
                if session.phase == SessionPhase::Started {
                    self.notify(&client, CaptureState::Started);
                }
                session.clients.insert(client_id, client);
            }
            SessionPhase::Stopping => {
                tracing::info!("Session {} stopping, parking client {}", self.session_id, client_id);
                session.pending_on_restart.insert(client_id, client);
            }
            SessionPhase::Stopped => {
                session.params = client.params;
                session.clients.insert(client_id, client);
                let params = self.begin_start(&mut session);
                drop(session);
                self.host.start(self.session_id, &params, self.event_sink());
            }
        }
    }

    fn stop_capture(&self, client_id: ClientId) {
        let mut session = self.session.lock();

        let removed = match session.clients.remove(&client_id) {
            Some(client) => Some(client),
            None => session.pending_on_restart.remove(&client_id),
        };
        let Some(client) = removed else {
            tracing::debug!("Client {} already gone", client_id);
            return;
        };
        self.notify(&client, CaptureState::Stopped);

        if session.clients.is_empty()
            && matches!(session.phase, SessionPhase::Starting | SessionPhase::Started)
        {
            session.phase = SessionPhase::Stopping;
            drop(session);
            tracing::info!("Last client left, stopping session {}", self.session_id);
            self.host.stop(self.session_id);
        }
    }

    fn suspend_capture(&self, suspend: bool) {
        let mut session = self.session.lock();
        if session.phase != SessionPhase::Started || session.suspended == suspend {
            tracing::debug!(
                "Ignoring suspend({}) in {:?} (suspended: {})",
                suspend,
                session.phase,
                session.suspended
            );
            return;
        }
        session.suspended = suspend;
        drop(session);

        if suspend {
            self.host.pause(self.session_id);
        } else {
            self.host.resume(self.session_id);
        }
    }

    fn on_state_changed(self: &Arc<Self>, state: CaptureState) {
        let mut session = self.session.lock();
        tracing::debug!("Session {} reported {}", self.session_id, state);

        match state {
            CaptureState::Started => {
                if session.phase != SessionPhase::Starting {
                    tracing::warn!("Unexpected started in {:?}", session.phase);
                    return;
                }
                session.phase = SessionPhase::Started;
                tracing::info!("Capture session {} started", self.session_id);
                self.notify_all(&session, CaptureState::Started);
            }
            CaptureState::Stopped => {
                session.phase = SessionPhase::Stopped;
                // In-flight frames keep their buffers; their releases still go out
                session.buffers.clear();
                tracing::info!("Capture session {} stopped", self.session_id);
                if !session.clients.is_empty() || !session.pending_on_restart.is_empty() {
                    self.restart(session);
                }
            }
            CaptureState::Paused | CaptureState::Resumed => {
                self.notify_all(&session, state);
            }
            CaptureState::Error => {
                self.fail(&mut session, Error::Transport("device reported an error".into()))
            }
            CaptureState::Ended => self.fail(&mut session, Error::SourceEnded),
            CaptureState::Starting | CaptureState::Stopping => {}
        }
    }

    /// Replay parked clients with the largest requested geometry
    fn restart(self: &Arc<Self>, mut session: MutexGuard<'_, Session>) {
        let parked: Vec<_> = session.pending_on_restart.drain().collect();
        session.clients.extend(parked);

        let (width, height, rate) = session.clients.values().fold((0, 0, 0.0f64), |acc, c| {
            let format = c.params.requested_format;
            (
                acc.0.max(format.frame_size.width),
                acc.1.max(format.frame_size.height),
                acc.2.max(format.frame_rate),
            )
        });
        session.params.requested_format.frame_size = Size::new(width, height);
        session.params.requested_format.frame_rate = rate;

        let params = self.begin_start(&mut session);
        drop(session);
        self.host.start(self.session_id, &params, self.event_sink());
    }

    /// Enter a terminal phase; every client hears about it and is dropped
    /// Fatal errors finish the session; anything else is logged and the
    /// session carries on
    fn fail(&self, session: &mut Session, error: Error) {
        if !error.is_session_fatal() {
            if error.is_recoverable() {
                tracing::warn!("Capture session {}: {}", self.session_id, error);
            } else {
                tracing::error!("Capture session {}: {}", self.session_id, error);
            }
            return;
        }
        tracing::debug!("Capture session {} failing on {}", self.session_id, error);
        let phase = match error {
            Error::SourceEnded => SessionPhase::Ended,
            _ => SessionPhase::Error,
        };
        self.finish(session, phase);
    }

    fn finish(&self, session: &mut Session, phase: SessionPhase) {
        session.phase = phase;
        let state = phase.as_state();
        tracing::warn!("Capture session {} finished: {}", self.session_id, state);
        self.notify_all(session, state);
        for client in session.pending_on_restart.values() {
            self.notify(client, state);
        }
        session.clients.clear();
        session.pending_on_restart.clear();
    }

    fn on_buffer_created(&self, buffer_id: BufferId, handle: SharedMemoryHandle, size: usize) {
        let mut session = self.session.lock();
        if session.phase != SessionPhase::Started {
            tracing::debug!("Closing buffer {} created in {:?}", buffer_id, session.phase);
            return;
        }

        let region = match handle.map(size) {
            Ok(region) => region,
            Err(e) => {
                tracing::debug!("Buffer {} not mapped", buffer_id);
                self.fail(&mut session, e);
                return;
            }
        };

        if session.buffers.contains_key(&buffer_id) {
            tracing::error!("Buffer {} created twice", buffer_id);
            debug_assert!(false, "duplicate buffer id {buffer_id}");
            return;
        }
        session
            .buffers
            .insert(buffer_id, Arc::new(ClientBuffer::new(buffer_id, region)));
    }

    /// Hand a buffer straight back without building a frame
    fn return_buffer(&self, buffer_id: BufferId) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.host
            .release_buffer(self.session_id, buffer_id, SyncToken::NULL, -1.0);
    }

    fn on_buffer_ready(&self, buffer_id: BufferId, info: FrameInfo) {
        let mut session = self.session.lock();

        let supported = is_supported(info.pixel_format, info.storage_type);
        if !supported || session.phase != SessionPhase::Started || session.suspended {
            session.stats.buffers_rejected += 1;
            let (phase, suspended) = (session.phase, session.suspended);
            drop(session);
            self.return_buffer(buffer_id);
            if !supported {
                tracing::error!(
                    "Buffer {} has unsupported {} in {:?} storage",
                    buffer_id,
                    info.pixel_format,
                    info.storage_type
                );
                debug_assert!(false, "unsupported buffer format");
            } else {
                tracing::debug!(
                    "Returned buffer {} (phase {:?}, suspended {})",
                    buffer_id,
                    phase,
                    suspended
                );
            }
            return;
        }

        let Some(buffer) = session.buffers.get(&buffer_id).cloned() else {
            session.stats.buffers_rejected += 1;
            drop(session);
            tracing::error!("Buffer {} ready before it was created", buffer_id);
            self.return_buffer(buffer_id);
            debug_assert!(false, "ready event for unknown buffer {buffer_id}");
            return;
        };

        let reference_time = info.reference_time;
        let first = *session.first_reference_time.get_or_insert(reference_time);
        let timestamp = if info.timestamp.is_zero() {
            reference_time.saturating_sub(first)
        } else {
            info.timestamp
        };
        let frame_rate = session.params.requested_format.frame_rate;

        let desc = FrameDescriptor {
            format: info.pixel_format,
            storage: StorageType::SharedMemory,
            coded_size: info.coded_size,
            visible_rect: info.visible_rect,
            natural_size: info.visible_rect.size(),
            timestamp,
            metadata: FrameMetadata {
                reference_time: Some(reference_time),
                frame_rate: (frame_rate > 0.0).then_some(frame_rate),
                extra: info.metadata,
            },
        };
        let backing: Arc<dyn FrameBacking> = buffer;
        let frame = match Frame::new(desc, Some(backing)) {
            Ok(frame) => frame,
            Err(e) => {
                session.stats.buffers_rejected += 1;
                self.fail(
                    &mut session,
                    Error::MalformedBuffer(format!("buffer {buffer_id}: {e}")),
                );
                drop(session);
                self.return_buffer(buffer_id);
                return;
            }
        };

        let host = self.host.clone();
        let io = self.ctx.io.clone();
        let alive = self.alive.clone();
        let released = self.released.clone();
        let session_id = self.session_id;
        frame.add_destruction_observer(move |release: ReleaseInfo| {
            io.post(alive.bind(move || {
                released.fetch_add(1, Ordering::Relaxed);
                host.release_buffer(
                    session_id,
                    buffer_id,
                    release.sync_token,
                    release.resource_utilization,
                );
            }));
        });

        let targets: Vec<(DeliverCallback, CancellationToken)> = session
            .clients
            .values()
            .map(|c| (c.deliver_cb.clone(), c.token.clone()))
            .collect();
        session.stats.frames_captured += 1;
        session.stats.frames_delivered += targets.len() as u64;
        drop(session);

        for (deliver, token) in targets {
            token.run(|| deliver(frame.clone(), reference_time));
        }
    }

    fn on_buffer_destroyed(&self, buffer_id: BufferId) {
        let Some(buffer) = self.session.lock().buffers.remove(&buffer_id) else {
            tracing::debug!("Ignoring destroy of unknown buffer {}", buffer_id);
            return;
        };

        let holders = Arc::strong_count(&buffer) - 1;
        if holders != 0 {
            tracing::error!(
                "Buffer {} destroyed while {} frame(s) still reference it",
                buffer_id,
                holders
            );
            debug_assert!(false, "buffer {buffer_id} destroyed while in use");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FakeCaptureHost, HostCall};
    use crate::types::{PixelFormat, Rect};

    type StateLog = Arc<Mutex<Vec<(ClientId, CaptureState)>>>;
    type FrameLog = Arc<Mutex<Vec<(ClientId, Frame)>>>;

    struct Harness {
        ctx: PipelineContext,
        host: Arc<FakeCaptureHost>,
        client: VideoCaptureClient,
        states: StateLog,
        frames: FrameLog,
    }

    impl Harness {
        fn new(host: FakeCaptureHost) -> Self {
            let ctx = PipelineContext::new().unwrap();
            let host = Arc::new(host);
            let client = VideoCaptureClient::new(1, host.clone(), ctx.clone());
            Self {
                ctx,
                host,
                client,
                states: Arc::default(),
                frames: Arc::default(),
            }
        }

        fn start(&self, id: ClientId, params: CaptureParams) {
            let states = self.states.clone();
            let frames = self.frames.clone();
            self.client.start_capture(
                id,
                params,
                move |state| states.lock().push((id, state)),
                move |frame, _| frames.lock().push((id, frame)),
            );
            self.settle();
        }

        fn settle(&self) {
            for _ in 0..3 {
                self.ctx.sync();
            }
        }

        fn states_of(&self, id: ClientId) -> Vec<CaptureState> {
            self.states
                .lock()
                .iter()
                .filter(|(c, _)| *c == id)
                .map(|(_, s)| *s)
                .collect()
        }

        fn send_frame(&self, buffer_id: BufferId, info: FrameInfo) {
            self.host.ready(1, buffer_id, info);
            self.settle();
        }
    }

    fn vga_params() -> CaptureParams {
        CaptureParams::new(Size::VGA, 30.0)
    }

    fn vga_info(ms: u64) -> FrameInfo {
        FrameInfo::new(PixelFormat::I420, Size::VGA, Duration::from_millis(ms))
    }

    const VGA_I420: usize = 640 * 480 * 3 / 2;

    #[test]
    fn start_and_stop_report_states_once() {
        let h = Harness::new(FakeCaptureHost::new(Vec::new()));
        h.start(7, vga_params());
        assert_eq!(h.client.phase(), SessionPhase::Started);
        assert_eq!(
            h.states_of(7),
            vec![CaptureState::Starting, CaptureState::Started]
        );

        h.client.stop_capture(7);
        h.settle();
        h.client.stop_capture(7);
        h.settle();

        assert_eq!(h.client.phase(), SessionPhase::Stopped);
        assert_eq!(h.states_of(7).last(), Some(&CaptureState::Stopped));
        assert_eq!(h.states_of(7).len(), 3);
        let stops = h
            .host
            .calls()
            .iter()
            .filter(|c| matches!(c, HostCall::Stop { .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn frame_released_once_after_all_consumers_drop_it() {
        let h = Harness::new(FakeCaptureHost::new(Vec::new()));
        h.start(1, vga_params());
        h.start(2, vga_params());
        h.host.create_buffer(1, 10, VGA_I420);
        h.send_frame(10, vga_info(33));

        assert_eq!(h.frames.lock().len(), 2);
        assert!(h.host.released().is_empty());

        let view = {
            let frames = h.frames.lock();
            frames[0].1.wrap(Rect::new(0, 0, 320, 240), Size::QVGA).unwrap()
        };
        h.frames.lock().clear();
        h.settle();
        assert!(h.host.released().is_empty());

        view.set_release_sync_token(SyncToken(42));
        drop(view);
        h.settle();

        assert_eq!(h.host.released(), vec![(10, SyncToken(42), -1.0)]);
        assert_eq!(h.client.stats().frames_captured, 1);
    }

    #[test]
    fn suspended_session_returns_buffers() {
        let h = Harness::new(FakeCaptureHost::new(Vec::new()));
        h.start(1, vga_params());
        h.host.create_buffer(1, 3, VGA_I420);

        h.client.suspend_capture(true);
        h.settle();
        assert!(h.states_of(1).contains(&CaptureState::Paused));

        h.send_frame(3, vga_info(33));
        assert!(h.frames.lock().is_empty());
        assert_eq!(h.host.released(), vec![(3, SyncToken::NULL, -1.0)]);

        h.client.suspend_capture(false);
        h.settle();
        h.send_frame(3, vga_info(66));
        assert_eq!(h.frames.lock().len(), 1);
    }

    #[test]
    fn short_buffer_is_a_transport_error() {
        let h = Harness::new(FakeCaptureHost::new(Vec::new()));
        h.start(1, vga_params());
        h.host.create_buffer(1, 4, 1024);
        h.send_frame(4, vga_info(33));

        assert!(h.frames.lock().is_empty());
        assert_eq!(h.host.released().len(), 1);
        assert_eq!(h.client.phase(), SessionPhase::Error);
        assert_eq!(h.states_of(1).last(), Some(&CaptureState::Error));

        // Terminal: a new client is told immediately and the device is untouched
        let starts_before = h.host.calls().len();
        h.start(2, vga_params());
        assert_eq!(h.states_of(2), vec![CaptureState::Error]);
        assert_eq!(h.host.calls().len(), starts_before);
    }

    #[test]
    fn unmappable_buffer_keeps_session_running() {
        let h = Harness::new(FakeCaptureHost::new(Vec::new()));
        h.start(1, vga_params());
        h.host.create_buffer(1, 6, 0);
        h.settle();

        assert_eq!(h.client.phase(), SessionPhase::Started);
        assert_eq!(h.client.buffer_count(), 0);
        assert!(!h.states_of(1).contains(&CaptureState::Error));

        h.host.create_buffer(1, 7, VGA_I420);
        h.send_frame(7, vga_info(0));
        assert_eq!(h.frames.lock().len(), 1);
    }

    #[test]
    fn zero_timestamps_are_estimated_from_reference_time() {
        let h = Harness::new(FakeCaptureHost::new(Vec::new()));
        h.start(1, vga_params());
        h.host.create_buffer(1, 1, VGA_I420);
        h.host.create_buffer(1, 2, VGA_I420);

        let mut first = vga_info(0);
        first.reference_time = Duration::from_millis(500);
        let mut second = vga_info(0);
        second.reference_time = Duration::from_millis(533);
        h.send_frame(1, first);
        h.send_frame(2, second);

        let frames = h.frames.lock();
        assert_eq!(frames[0].1.timestamp(), Duration::ZERO);
        assert_eq!(frames[1].1.timestamp(), Duration::from_millis(33));
        assert_eq!(
            frames[1].1.metadata().reference_time,
            Some(Duration::from_millis(533))
        );
    }

    #[test]
    fn clients_parked_while_stopping_restart_with_largest_size() {
        let h = Harness::new(FakeCaptureHost::new(Vec::new()).with_auto_ack(false));
        h.start(1, vga_params());
        h.host.set_state(1, CaptureState::Started);
        h.settle();

        h.client.stop_capture(1);
        h.settle();
        assert_eq!(h.client.phase(), SessionPhase::Stopping);

        h.start(2, CaptureParams::new(Size::HD_720P, 30.0));
        h.start(3, CaptureParams::new(Size::QVGA, 60.0));
        assert_eq!(h.client.client_count(), 2);

        h.host.set_state(1, CaptureState::Stopped);
        h.settle();

        assert_eq!(h.client.phase(), SessionPhase::Starting);
        let last_start = h
            .host
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                HostCall::Start { params, .. } => Some(params),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_start.requested_format.frame_size, Size::HD_720P);
        assert_eq!(last_start.requested_format.frame_rate, 60.0);
    }

    #[test]
    fn releases_continue_after_stop() {
        let h = Harness::new(FakeCaptureHost::new(Vec::new()));
        h.start(1, vga_params());
        h.host.create_buffer(1, 9, VGA_I420);
        h.send_frame(9, vga_info(33));
        let held = h.frames.lock().pop().unwrap().1;

        h.client.stop_capture(1);
        h.settle();
        assert_eq!(h.client.phase(), SessionPhase::Stopped);
        assert_eq!(h.client.buffer_count(), 0);

        // Destroy for a buffer already cleared from the map is ignored
        h.host.destroy(1, 9);
        h.settle();

        drop(held);
        h.settle();
        assert_eq!(h.host.released(), vec![(9, SyncToken::NULL, -1.0)]);
    }

    #[test]
    fn stopped_client_gets_no_more_frames() {
        let h = Harness::new(FakeCaptureHost::new(Vec::new()));
        h.start(1, vga_params());
        h.start(2, vga_params());
        h.host.create_buffer(1, 5, VGA_I420);

        h.client.stop_capture(1);
        h.send_frame(5, vga_info(33));

        let frames = h.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 2);
    }

    #[test]
    fn requested_rate_is_clamped() {
        let h = Harness::new(FakeCaptureHost::new(Vec::new()));
        h.start(1, CaptureParams::new(Size::VGA, 5000.0));
        let rate = h.host.calls().into_iter().find_map(|c| match c {
            HostCall::Start { params, .. } => Some(params.requested_format.frame_rate),
            _ => None,
        });
        assert_eq!(rate, Some(MAX_FRAMES_PER_SECOND));
    }

    #[test]
    fn formats_are_answered_on_main() {
        let format = VideoCaptureFormat::new(Size::VGA, 0.0, PixelFormat::I420);
        let h = Harness::new(FakeCaptureHost::new(vec![format]));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let main = h.ctx.main.clone();
        h.client.get_device_supported_formats(move |formats| {
            tx.send((formats, main.runs_tasks_on_current_thread())).unwrap();
        });
        let (formats, on_main) = rx.recv().unwrap();
        assert_eq!(formats, vec![format]);
        assert!(on_main);
    }
}
