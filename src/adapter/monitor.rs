//! Muted detection for a frame source
//!
//! A delayed task on the I/O runner samples the registry's delivered-frame
//! counter. No new frames since the last sample means the source is muted;
//! transitions are reported on the main runner.

use crate::cancel::CancellationToken;
use crate::task::{PipelineContext, TaskRunner};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Rate assumed when the source reports none
pub const DEFAULT_FRAME_RATE: f64 = 30.0;
/// Intervals before the first check, giving the source time to start
pub const FIRST_FRAME_TIMEOUT_INTERVALS: u32 = 100;
/// Intervals between later checks
pub const NORMAL_TIMEOUT_INTERVALS: u32 = 25;

/// Receives `true` when the source goes quiet and `false` when it resumes
pub type MutedCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// How often the monitor samples, in source frame intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub first_frame_timeout_intervals: u32,
    pub normal_timeout_intervals: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            first_frame_timeout_intervals: FIRST_FRAME_TIMEOUT_INTERVALS,
            normal_timeout_intervals: NORMAL_TIMEOUT_INTERVALS,
        }
    }
}

/// Frame interval for a nominal rate, falling back to [`DEFAULT_FRAME_RATE`]
pub fn frame_interval(source_frame_rate: f64) -> Duration {
    let fps = if source_frame_rate.is_finite() && source_frame_rate > 0.0 {
        source_frame_rate
    } else {
        DEFAULT_FRAME_RATE
    };
    Duration::from_secs_f64(1.0 / fps)
}

struct MonitorTask {
    io: TaskRunner,
    main: TaskRunner,
    token: CancellationToken,
    counter: Arc<AtomicU64>,
    on_muted: MutedCallback,
    last_count: u64,
    muted: bool,
    period: Duration,
}

impl MonitorTask {
    fn schedule(self, delay: Duration) {
        let io = self.io.clone();
        let token = self.token.clone();
        io.post_delayed(delay, token.bind(move || self.check()));
    }

    fn check(mut self) {
        let count = self.counter.load(Ordering::Relaxed);
        let muted = count == self.last_count;
        if muted != self.muted {
            self.muted = muted;
            tracing::info!("Frame source {}", if muted { "muted" } else { "unmuted" });
            let on_muted = self.on_muted.clone();
            self.main.post(self.token.bind(move || on_muted(muted)));
        }
        self.last_count = count;
        let period = self.period;
        self.schedule(period);
    }
}

/// Handle to a running monitor; dropping it does not stop it
#[derive(Debug)]
pub struct FrameMonitor {
    token: CancellationToken,
    io: TaskRunner,
}

impl FrameMonitor {
    /// Start sampling `counter`
    pub fn start(
        ctx: &PipelineContext,
        source_frame_rate: f64,
        settings: MonitorSettings,
        counter: Arc<AtomicU64>,
        on_muted: MutedCallback,
    ) -> Self {
        let interval = frame_interval(source_frame_rate);
        let token = CancellationToken::new();
        let task = MonitorTask {
            io: ctx.io.clone(),
            main: ctx.main.clone(),
            token: token.clone(),
            last_count: counter.load(Ordering::Relaxed),
            counter,
            on_muted,
            muted: false,
            period: interval * settings.normal_timeout_intervals.max(1),
        };
        tracing::debug!(
            "Frame monitor started, first check in {:?}",
            interval * settings.first_frame_timeout_intervals
        );
        task.schedule(interval * settings.first_frame_timeout_intervals);

        Self {
            token,
            io: ctx.io.clone(),
        }
    }

    /// Stop sampling; no muted callback runs after this returns
    pub fn stop(&self) {
        if self.io.runs_tasks_on_current_thread() {
            self.token.cancel();
        } else {
            self.token.cancel_and_wait();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }
}
