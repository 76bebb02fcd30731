//! Track-to-adapter registry
//!
//! Registration bookkeeping is requested from any thread but applied on
//! the I/O runner, where frames arrive and are delivered without another
//! thread hop.

use super::monitor::{FrameMonitor, MonitorSettings, MutedCallback};
use super::{ConstraintSet, ResolutionAdapter, TrackCallback, TrackId};
use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::frame::Frame;
use crate::task::PipelineContext;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Inner {
    ctx: PipelineContext,
    alive: CancellationToken,
    /// Only touched from the I/O runner
    adapters: Mutex<Vec<ResolutionAdapter>>,
    source_frame_rate: Mutex<f64>,
    tokens: Mutex<HashMap<TrackId, CancellationToken>>,
    frame_counter: Arc<AtomicU64>,
    frames_dropped: AtomicU64,
    monitor: Mutex<Option<FrameMonitor>>,
}

/// Maps tracks to the adapter serving their constraint set
#[derive(Clone)]
pub struct TrackAdapterRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TrackAdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackAdapterRegistry")
            .field("tracks", &self.inner.tokens.lock().len())
            .field("frames_delivered", &self.frames_delivered())
            .finish()
    }
}

impl TrackAdapterRegistry {
    /// `source_frame_rate` is the source's nominal rate, 0 when unknown
    pub fn new(ctx: PipelineContext, source_frame_rate: f64) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                alive: CancellationToken::new(),
                adapters: Mutex::new(Vec::new()),
                source_frame_rate: Mutex::new(source_frame_rate),
                tokens: Mutex::new(HashMap::new()),
                frame_counter: Arc::new(AtomicU64::new(0)),
                frames_dropped: AtomicU64::new(0),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Register `track_id`.
    ///
    /// Constraints are checked here; the registration itself lands on the
    /// I/O runner, ahead of any frame posted after this call.
    pub fn add_track(
        &self,
        track_id: TrackId,
        constraints: ConstraintSet,
        callback: impl Fn(Frame, Duration) + Send + Sync + 'static,
    ) -> Result<()> {
        constraints.validate()?;

        let token = CancellationToken::new();
        if let Some(previous) = self.inner.tokens.lock().insert(track_id, token.clone()) {
            tracing::error!("Track {} registered twice", track_id);
            previous.cancel();
            debug_assert!(false, "track {track_id} registered twice");
        }

        let inner = self.inner.clone();
        let callback: TrackCallback = Arc::new(callback);
        self.inner.ctx.io.post(self.inner.alive.bind(move || {
            let mut adapters = inner.adapters.lock();
            for adapter in adapters.iter_mut() {
                adapter.remove_track(track_id);
            }
            match adapters.iter_mut().find(|a| *a.constraints() == constraints) {
                Some(adapter) => adapter.add_track(track_id, callback, token),
                None => {
                    let fps = *inner.source_frame_rate.lock();
                    let mut adapter = ResolutionAdapter::new(constraints, fps);
                    adapter.add_track(track_id, callback, token);
                    tracing::debug!("New adapter for {}", constraints);
                    adapters.push(adapter);
                }
            }
            adapters.retain(|a| !a.is_empty());
        }));
        Ok(())
    }

    /// Unregister `track_id`; its callback never runs after this returns
    pub fn remove_track(&self, track_id: TrackId) {
        let Some(token) = self.inner.tokens.lock().remove(&track_id) else {
            return;
        };
        if self.inner.ctx.io.runs_tasks_on_current_thread() {
            token.cancel();
        } else {
            token.cancel_and_wait();
        }

        let inner = self.inner.clone();
        self.inner.ctx.io.post(self.inner.alive.bind(move || {
            let mut adapters = inner.adapters.lock();
            for adapter in adapters.iter_mut() {
                adapter.remove_track(track_id);
            }
            adapters.retain(|a| !a.is_empty());
        }));
    }

    /// Feed one frame to every adapter. Runs on the I/O runner.
    pub fn deliver_frame(&self, frame: &Frame, reference_time: Duration) {
        debug_assert!(self.inner.ctx.io.runs_tasks_on_current_thread());
        self.inner.frame_counter.fetch_add(1, Ordering::Relaxed);

        let mut adapters = self.inner.adapters.lock();
        for adapter in adapters.iter_mut() {
            if !adapter.deliver(frame, reference_time) {
                self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Update the nominal source rate used by frame-rate adaptation
    pub fn set_source_frame_rate(&self, fps: f64) {
        *self.inner.source_frame_rate.lock() = fps;
        let inner = self.inner.clone();
        self.inner.ctx.io.post(self.inner.alive.bind(move || {
            for adapter in inner.adapters.lock().iter_mut() {
                adapter.set_source_frame_rate(fps);
            }
        }));
    }

    /// Watch the delivered-frame counter and report muted transitions
    pub fn start_frame_monitor(
        &self,
        settings: MonitorSettings,
        on_muted: impl Fn(bool) + Send + Sync + 'static,
    ) {
        let fps = *self.inner.source_frame_rate.lock();
        let on_muted: MutedCallback = Arc::new(on_muted);
        let monitor = FrameMonitor::start(
            &self.inner.ctx,
            fps,
            settings,
            self.inner.frame_counter.clone(),
            on_muted,
        );
        if let Some(previous) = self.inner.monitor.lock().replace(monitor) {
            previous.stop();
        }
    }

    pub fn stop_frame_monitor(&self) {
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.stop();
        }
    }

    /// Frames fed through [`deliver_frame`](Self::deliver_frame)
    pub fn frames_delivered(&self) -> u64 {
        self.inner.frame_counter.load(Ordering::Relaxed)
    }

    /// Per-adapter frame drops
    pub fn frames_dropped(&self) -> u64 {
        self.inner.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn track_count(&self) -> usize {
        self.inner.tokens.lock().len()
    }

    pub fn adapter_count(&self) -> usize {
        self.inner.adapters.lock().len()
    }

    /// Cancel every registration and the monitor
    pub fn shutdown(&self) {
        self.stop_frame_monitor();
        self.inner.alive.cancel();
        for (_, token) in self.inner.tokens.lock().drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::frame::FrameDescriptor;
    use crate::types::{PixelFormat, Size};

    type Log = Arc<Mutex<Vec<(TrackId, Frame)>>>;

    fn frame(size: Size, ms: u64) -> Frame {
        let desc = FrameDescriptor::new(PixelFormat::I420, size, Duration::from_millis(ms));
        Frame::from_bytes(desc, vec![0; PixelFormat::I420.allocation_size(size)]).unwrap()
    }

    fn add(registry: &TrackAdapterRegistry, log: &Log, id: TrackId, c: ConstraintSet) -> Result<()> {
        let log = log.clone();
        registry.add_track(id, c, move |frame, _| log.lock().push((id, frame)))
    }

    fn deliver(ctx: &PipelineContext, registry: &TrackAdapterRegistry, frame: Frame) {
        let registry = registry.clone();
        ctx.io
            .post(move || registry.deliver_frame(&frame, frame.timestamp()));
        ctx.sync();
    }

    #[test]
    fn two_tracks_two_adaptations() {
        let ctx = PipelineContext::new().unwrap();
        let registry = TrackAdapterRegistry::new(ctx.clone(), 30.0);
        let log: Log = Arc::default();
        add(&registry, &log, 1, ConstraintSet::new().with_max_size(640, 480)).unwrap();
        add(&registry, &log, 2, ConstraintSet::new().with_max_height(360)).unwrap();

        let source = frame(Size::VGA, 0);
        deliver(&ctx, &registry, source.clone());

        let log = log.lock();
        assert_eq!(log.len(), 2);
        let first = &log.iter().find(|(id, _)| *id == 1).unwrap().1;
        let second = &log.iter().find(|(id, _)| *id == 2).unwrap().1;
        assert!(Frame::ptr_eq(first, &source));
        assert_eq!(second.visible_rect(), crate::types::Rect::new(0, 60, 640, 360));
        assert_eq!(second.natural_size(), Size::new(640, 360));
    }

    #[test]
    fn identical_constraints_share_an_adapter() {
        let ctx = PipelineContext::new().unwrap();
        let registry = TrackAdapterRegistry::new(ctx.clone(), 30.0);
        let log: Log = Arc::default();
        let c = ConstraintSet::new().with_max_size(320, 240);
        add(&registry, &log, 1, c).unwrap();
        add(&registry, &log, 2, c).unwrap();
        add(&registry, &log, 3, ConstraintSet::new()).unwrap();
        ctx.sync();
        assert_eq!(registry.adapter_count(), 2);

        registry.remove_track(1);
        registry.remove_track(3);
        ctx.sync();
        assert_eq!(registry.adapter_count(), 1);
        assert_eq!(registry.track_count(), 1);
    }

    #[test]
    fn invalid_constraints_fail_before_any_frame() {
        let ctx = PipelineContext::new().unwrap();
        let registry = TrackAdapterRegistry::new(ctx.clone(), 30.0);
        let log: Log = Arc::default();
        let err = add(
            &registry,
            &log,
            1,
            ConstraintSet::new().with_aspect_ratio(Some(2.0), Some(1.0)),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ConstraintViolation {
                constraint: "min_aspect_ratio",
                ..
            }
        ));

        deliver(&ctx, &registry, frame(Size::VGA, 0));
        assert!(log.lock().is_empty());
        assert_eq!(registry.track_count(), 0);
    }

    #[test]
    fn bounded_track_crops_large_and_passes_small() {
        let ctx = PipelineContext::new().unwrap();
        let registry = TrackAdapterRegistry::new(ctx.clone(), 30.0);
        let log: Log = Arc::default();
        add(&registry, &log, 1, ConstraintSet::new().with_max_size(800, 700)).unwrap();

        deliver(&ctx, &registry, frame(Size::HD_720P, 0));
        let small = frame(Size::QVGA, 33);
        deliver(&ctx, &registry, small.clone());

        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].1.visible_rect().size(), Size::new(800, 700));
        assert!(Frame::ptr_eq(&log[1].1, &small));
    }

    #[test]
    fn zero_fps_source_still_delivers() {
        let ctx = PipelineContext::new().unwrap();
        let registry = TrackAdapterRegistry::new(ctx.clone(), 0.0);
        let log: Log = Arc::default();
        add(&registry, &log, 1, ConstraintSet::new().with_max_frame_rate(10.0)).unwrap();

        deliver(&ctx, &registry, frame(Size::VGA, 0));
        deliver(&ctx, &registry, frame(Size::VGA, 150));
        assert_eq!(log.lock().len(), 2);
        assert_eq!(registry.frames_delivered(), 2);
    }

    #[test]
    fn removed_track_sees_no_more_frames() {
        let ctx = PipelineContext::new().unwrap();
        let registry = TrackAdapterRegistry::new(ctx.clone(), 30.0);
        let log: Log = Arc::default();
        add(&registry, &log, 1, ConstraintSet::new()).unwrap();
        add(&registry, &log, 2, ConstraintSet::new()).unwrap();

        deliver(&ctx, &registry, frame(Size::VGA, 0));
        registry.remove_track(1);
        registry.remove_track(1);
        deliver(&ctx, &registry, frame(Size::VGA, 33));

        let ids: Vec<_> = log.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.iter().filter(|id| **id == 1).count(), 1);
        assert_eq!(ids.iter().filter(|id| **id == 2).count(), 2);
    }

    #[test]
    fn delivery_is_monotonic_per_track() {
        let ctx = PipelineContext::new().unwrap();
        let registry = TrackAdapterRegistry::new(ctx.clone(), 30.0);
        let log: Log = Arc::default();
        add(&registry, &log, 1, ConstraintSet::new().with_max_height(240)).unwrap();

        for ms in [0, 33, 20, 66, 66, 50, 100] {
            deliver(&ctx, &registry, frame(Size::VGA, ms));
        }
        let stamps: Vec<_> = log.lock().iter().map(|(_, f)| f.timestamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(stamps.len(), 5);
        assert_eq!(registry.frames_dropped(), 2);
    }
}
