//! Frame scheduling and presentation
//!
//! [`FrameScheduler`] runs a [`SchedulerCore`] on a dedicated presentation
//! thread. The thread sleeps on a condition variable until the front frame
//! is due, a new frame is readable, or the idle interval passes. Paints and
//! client notifications are posted to the main runner behind a token that
//! `flush` and `stop` cancel before returning.

mod clock;
mod core;
mod stream;

pub use self::clock::{ManualTimeSource, TimeSource, WallClockTimeSource};
pub use self::core::{
    BufferingState, Effect, PipelineStatistics, SchedulerCore, SchedulerState, MAX_VIDEO_FRAMES,
};
pub use self::stream::{
    FrameStream, ReadResult, ReadyNotifier, TrackFrameStream, TrackStreamSink,
};

use crate::cancel::CancellationToken;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::task::{PipelineContext, TaskRunner};
use crate::types::Size;

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Receives scheduler notifications on the main runner
pub trait RendererClient: Send + Sync {
    fn on_buffering_state_change(&self, state: BufferingState);

    fn on_ended(&self);

    fn on_error(&self, error: Error);

    fn on_statistics_update(&self, _stats: PipelineStatistics) {}

    fn on_natural_size_change(&self, _size: Size) {}
}

/// Presentation callback, run on the main runner when a frame is due
pub type PaintCallback = Arc<dyn Fn(Frame) + Send + Sync>;

struct Shared {
    core: Mutex<SchedulerCore>,
    wake: Condvar,
    running: AtomicBool,
    clock: Arc<dyn TimeSource>,
    client: Arc<dyn RendererClient>,
    paint: PaintCallback,
    main: TaskRunner,
    /// Replaced on flush; cancelled on flush and stop
    token: Mutex<CancellationToken>,
    idle_interval: Duration,
}

impl Shared {
    fn dispatch(&self, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }
        let token = self.token.lock().clone();
        for effect in effects {
            let client = self.client.clone();
            let paint = self.paint.clone();
            self.main.post(token.bind(move || match effect {
                Effect::Paint(frame) => paint(frame),
                Effect::BufferingStateChanged(state) => client.on_buffering_state_change(state),
                Effect::Ended => client.on_ended(),
                Effect::NaturalSizeChanged(size) => client.on_natural_size_change(size),
                Effect::Error(error) => client.on_error(error),
                Effect::Statistics(stats) => client.on_statistics_update(stats),
            }));
        }
    }

    fn wake(&self) {
        self.wake.notify_one();
    }

    fn run(&self) {
        tracing::debug!("Presentation thread started");
        let mut core = self.core.lock();
        while self.running.load(Ordering::Acquire) {
            let wait = core.tick(Instant::now(), self.clock.as_ref());
            self.dispatch(core.take_effects());

            let wait = wait.map_or(self.idle_interval, |w| w.min(self.idle_interval));
            if !wait.is_zero() {
                self.wake.wait_for(&mut core, wait);
            }
        }
        tracing::debug!("Presentation thread exiting");
    }

    /// Cancel everything posted so far without blocking the main runner on
    /// itself
    fn cancel_posted(&self, token: &CancellationToken) {
        if self.main.runs_tasks_on_current_thread() {
            token.cancel();
        } else {
            token.cancel_and_wait();
        }
    }
}

/// Wall-clock frame scheduler with its own presentation thread
pub struct FrameScheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("state", &self.state())
            .field("running", &self.shared.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl FrameScheduler {
    pub fn new(
        ctx: &PipelineContext,
        config: &SchedulerConfig,
        clock: Arc<dyn TimeSource>,
        client: Arc<dyn RendererClient>,
        paint: impl Fn(Frame) + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(SchedulerCore::new(config)),
                wake: Condvar::new(),
                running: AtomicBool::new(false),
                clock,
                client,
                paint: Arc::new(paint),
                main: ctx.main.clone(),
                token: Mutex::new(CancellationToken::new()),
                idle_interval: config.idle_interval(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Attach `stream` and start the presentation thread
    pub fn initialize(&self, mut stream: Box<dyn FrameStream>) -> Result<()> {
        let weak = Arc::downgrade(&self.shared);
        stream.set_ready_notifier(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.wake();
            }
        }));
        self.shared.core.lock().initialize(stream)?;

        self.shared.running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("trackfeed-present".into())
            .spawn(move || shared.run())
            .inspect_err(|_| self.shared.running.store(false, Ordering::Release))?;
        *self.thread.lock() = Some(handle);
        tracing::info!("Frame scheduler initialized");
        Ok(())
    }

    pub fn start_playing_from(&self, timestamp: Duration) -> Result<()> {
        self.shared.core.lock().start_playing_from(timestamp)?;
        self.shared.wake();
        Ok(())
    }

    /// Drop queued frames. No paint or client callback from before the
    /// flush runs after this returns.
    pub fn flush(&self) -> Result<()> {
        let previous = {
            let mut core = self.shared.core.lock();
            if core.state() == SchedulerState::Flushed {
                return Ok(());
            }
            core.flush()?;
            let previous = std::mem::take(&mut *self.shared.token.lock());
            self.shared.dispatch(core.take_effects());
            previous
        };
        self.shared.cancel_posted(&previous);
        tracing::debug!("Frame scheduler flushed");
        Ok(())
    }

    /// Stop the presentation thread. Idempotent; nothing is posted after
    /// this returns.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.core.lock().stop();
        self.shared.wake();

        let token = self.shared.token.lock().clone();
        self.shared.cancel_posted(&token);

        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Presentation thread panicked");
            }
            tracing::info!("Frame scheduler stopped");
        }
    }

    pub fn set_background_rendering(&self, enabled: bool) {
        self.shared.core.lock().set_background_rendering(enabled);
        self.shared.wake();
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.core.lock().state()
    }

    pub fn buffering_state(&self) -> BufferingState {
        self.shared.core.lock().buffering_state()
    }

    pub fn statistics(&self) -> PipelineStatistics {
        self.shared.core.lock().statistics()
    }

    pub fn ready_frame_count(&self) -> usize {
        self.shared.core.lock().ready_frame_count()
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::VideoSink;

    #[derive(Default)]
    struct Recorder {
        buffering: Mutex<Vec<BufferingState>>,
        ended: Mutex<u32>,
        stats: Mutex<PipelineStatistics>,
    }

    impl RendererClient for Recorder {
        fn on_buffering_state_change(&self, state: BufferingState) {
            self.buffering.lock().push(state);
        }

        fn on_ended(&self) {
            *self.ended.lock() += 1;
        }

        fn on_error(&self, error: Error) {
            panic!("unexpected error {error}");
        }

        fn on_statistics_update(&self, stats: PipelineStatistics) {
            *self.stats.lock() = stats;
        }
    }

    fn wait_until(ctx: &PipelineContext, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            ctx.sync();
        }
    }

    struct Setup {
        ctx: PipelineContext,
        clock: Arc<WallClockTimeSource>,
        client: Arc<Recorder>,
        painted: Arc<Mutex<Vec<Duration>>>,
        sink: Arc<TrackStreamSink>,
        scheduler: FrameScheduler,
    }

    fn setup(config: SchedulerConfig) -> Setup {
        let ctx = PipelineContext::new().unwrap();
        let clock = Arc::new(WallClockTimeSource::new());
        let client = Arc::new(Recorder::default());
        let painted = Arc::new(Mutex::new(Vec::new()));
        let p = painted.clone();
        let scheduler = FrameScheduler::new(&ctx, &config, clock.clone(), client.clone(), move |f| {
            p.lock().push(f.timestamp())
        });
        let (stream, sink) = TrackFrameStream::new(8);
        scheduler.initialize(Box::new(stream)).unwrap();
        Setup {
            ctx,
            clock,
            client,
            painted,
            sink,
            scheduler,
        }
    }

    fn push(sink: &TrackStreamSink, ms: u64) {
        sink.on_frame(Frame::black(Size::new(8, 8), Duration::from_millis(ms)), Duration::ZERO);
    }

    #[test]
    fn paints_frames_in_order_on_main() {
        let s = setup(SchedulerConfig::default().with_low_delay(true));
        s.clock.start_ticking();
        s.scheduler.start_playing_from(Duration::ZERO).unwrap();
        for ms in [0, 10, 20, 30] {
            push(&s.sink, ms);
        }

        wait_until(&s.ctx, || s.painted.lock().len() + s.scheduler.statistics().frames_dropped as usize >= 4);
        let painted = s.painted.lock().clone();
        assert_eq!(painted.first(), Some(&Duration::ZERO));
        assert!(painted.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(
            s.client.buffering.lock().first(),
            Some(&BufferingState::HaveEnough)
        );
        s.scheduler.stop();
        assert_eq!(s.scheduler.state(), SchedulerState::Stopped);
    }

    #[test]
    fn ended_track_fires_ended_once() {
        let s = setup(SchedulerConfig::default());
        s.clock.start_ticking();
        s.scheduler.start_playing_from(Duration::ZERO).unwrap();
        push(&s.sink, 0);
        s.sink.on_ready_state_changed(crate::track::ReadyState::Ended);

        wait_until(&s.ctx, || *s.client.ended.lock() == 1);
        std::thread::sleep(Duration::from_millis(30));
        s.ctx.sync();
        assert_eq!(*s.client.ended.lock(), 1);
        assert_eq!(*s.painted.lock(), vec![Duration::ZERO]);
    }

    #[test]
    fn nothing_is_painted_after_flush_returns() {
        let s = setup(SchedulerConfig::default());
        s.scheduler.start_playing_from(Duration::ZERO).unwrap();
        for ms in 0..8 {
            push(&s.sink, ms * 1000);
        }
        wait_until(&s.ctx, || !s.painted.lock().is_empty());

        s.scheduler.flush().unwrap();
        let seen = s.painted.lock().len();
        s.scheduler.flush().unwrap();
        s.ctx.sync();
        assert_eq!(s.painted.lock().len(), seen);
        assert_eq!(s.scheduler.state(), SchedulerState::Flushed);
        assert_eq!(s.scheduler.ready_frame_count(), 0);
        assert_eq!(
            s.client.buffering.lock().last(),
            Some(&BufferingState::HaveNothing)
        );
    }

    #[test]
    fn stop_is_idempotent() {
        let s = setup(SchedulerConfig::default());
        s.scheduler.stop();
        s.scheduler.stop();
        assert!(matches!(
            s.scheduler.start_playing_from(Duration::ZERO),
            Err(Error::SchedulerStopped)
        ));
    }
}
