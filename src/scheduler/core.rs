//! Presentation decisions
//!
//! `SchedulerCore` owns the ready queue and the state machine. It never
//! sleeps and never calls out: every decision is recorded as an [`Effect`]
//! for the caller to carry out. Time is passed in, so the whole policy can
//! be driven by a manual clock.

use super::clock::TimeSource;
use super::stream::{FrameStream, ReadResult};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::types::Size;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default ready queue capacity
pub const MAX_VIDEO_FRAMES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    Uninitialized,
    Initializing,
    Flushed,
    Prerolling,
    Playing,
    Flushing,
    Stopped,
}

/// Signal for the playback clock: start it on `HaveEnough`, stop it on
/// `HaveNothing`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferingState {
    HaveNothing,
    HaveEnough,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatistics {
    /// Frames read from upstream
    pub frames_decoded: u64,
    pub frames_painted: u64,
    /// Frames dropped for lateness or ordering
    pub frames_dropped: u64,
    /// Expired frames purged while backgrounded or underflowed
    pub frames_dropped_background: u64,
}

/// Something the scheduler decided; carried out by the caller
#[derive(Debug)]
pub enum Effect {
    Paint(Frame),
    BufferingStateChanged(BufferingState),
    Ended,
    NaturalSizeChanged(Size),
    Error(Error),
    Statistics(PipelineStatistics),
}

pub struct SchedulerCore {
    max_ready_frames: usize,
    drop_frames: bool,
    low_delay: bool,
    state: SchedulerState,
    buffering_state: BufferingState,
    stream: Option<Box<dyn FrameStream>>,
    ready: VecDeque<Frame>,
    start_timestamp: Duration,
    received_end_of_stream: bool,
    rendered_end_of_stream: bool,
    read_failed: bool,
    painted_first_frame: bool,
    background_rendering: bool,
    last_painted: Option<Duration>,
    last_timestamp: Option<Duration>,
    last_frame_duration: Duration,
    natural_size: Option<Size>,
    stats: PipelineStatistics,
    reported_stats: PipelineStatistics,
    effects: Vec<Effect>,
}

impl std::fmt::Debug for SchedulerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("state", &self.state)
            .field("buffering_state", &self.buffering_state)
            .field("ready", &self.ready.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SchedulerCore {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_ready_frames: config.max_ready_frames.max(1),
            drop_frames: config.drop_frames,
            low_delay: config.low_delay,
            state: SchedulerState::Uninitialized,
            buffering_state: BufferingState::HaveNothing,
            stream: None,
            ready: VecDeque::new(),
            start_timestamp: Duration::ZERO,
            received_end_of_stream: false,
            rendered_end_of_stream: false,
            read_failed: false,
            painted_first_frame: false,
            background_rendering: false,
            last_painted: None,
            last_timestamp: None,
            last_frame_duration: Duration::ZERO,
            natural_size: None,
            stats: PipelineStatistics::default(),
            reported_stats: PipelineStatistics::default(),
            effects: Vec::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn buffering_state(&self) -> BufferingState {
        self.buffering_state
    }

    pub fn ready_frame_count(&self) -> usize {
        self.ready.len()
    }

    pub fn statistics(&self) -> PipelineStatistics {
        self.stats
    }

    /// Effects recorded since the last call
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn ensure_not_stopped(&self) -> Result<()> {
        if self.state == SchedulerState::Stopped {
            return Err(Error::SchedulerStopped);
        }
        Ok(())
    }

    fn invalid(&self, operation: &str) -> Error {
        Error::InvalidState(format!("{operation} while {:?}", self.state))
    }

    pub fn initialize(&mut self, mut stream: Box<dyn FrameStream>) -> Result<()> {
        self.ensure_not_stopped()?;
        if self.state != SchedulerState::Uninitialized {
            return Err(self.invalid("initialize"));
        }

        self.state = SchedulerState::Initializing;
        if let Err(e) = stream.initialize() {
            tracing::error!("Frame stream failed to initialize: {}", e);
            self.state = SchedulerState::Uninitialized;
            return Err(e);
        }
        self.stream = Some(stream);
        self.state = SchedulerState::Flushed;
        Ok(())
    }

    /// Begin prerolling. Frames before `timestamp` are discarded, except the
    /// latest, until the first paint.
    pub fn start_playing_from(&mut self, timestamp: Duration) -> Result<()> {
        self.ensure_not_stopped()?;
        if self.state != SchedulerState::Flushed {
            return Err(self.invalid("start_playing_from"));
        }
        tracing::debug!("Prerolling from {:?}", timestamp);
        self.start_timestamp = timestamp;
        self.state = SchedulerState::Prerolling;
        Ok(())
    }

    /// Discard queued frames. Flushing an already flushed scheduler does
    /// nothing.
    pub fn flush(&mut self) -> Result<()> {
        match self.state {
            SchedulerState::Flushed => return Ok(()),
            SchedulerState::Prerolling | SchedulerState::Playing => {}
            SchedulerState::Stopped => return Err(Error::SchedulerStopped),
            _ => return Err(self.invalid("flush")),
        }

        self.state = SchedulerState::Flushing;
        self.ready.clear();
        if let Some(stream) = self.stream.as_mut() {
            stream.reset();
        }
        self.received_end_of_stream = false;
        self.rendered_end_of_stream = false;
        self.read_failed = false;
        self.painted_first_frame = false;
        self.last_painted = None;
        self.last_timestamp = None;
        self.last_frame_duration = Duration::ZERO;
        self.set_buffering_state(BufferingState::HaveNothing);
        self.state = SchedulerState::Flushed;
        self.report_statistics();
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.state == SchedulerState::Stopped {
            return;
        }
        self.ready.clear();
        self.stream = None;
        self.state = SchedulerState::Stopped;
    }

    /// While backgrounded nothing is painted; expired frames are purged
    pub fn set_background_rendering(&mut self, enabled: bool) {
        self.background_rendering = enabled;
    }

    /// Advance to `now`. Returns how long until the front frame is due, if
    /// anything is waiting.
    pub fn tick(&mut self, now: Instant, clock: &dyn TimeSource) -> Option<Duration> {
        if !matches!(
            self.state,
            SchedulerState::Prerolling | SchedulerState::Playing
        ) {
            return None;
        }

        self.attempt_read();
        if self.state == SchedulerState::Prerolling {
            if self.painted_first_frame && clock.is_time_progressing() {
                self.remove_expired_frames(now, clock);
                self.attempt_read();
            }
            if self.have_enough_data() {
                self.transition_to_have_enough();
            }
        }

        let wait = if self.state == SchedulerState::Playing {
            self.render(now, clock)
        } else {
            None
        };
        self.report_statistics();
        wait
    }

    fn attempt_read(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        while !self.received_end_of_stream
            && !self.read_failed
            && self.ready.len() < self.max_ready_frames
        {
            match stream.read() {
                ReadResult::Frame(frame) if frame.is_end_of_stream() => {
                    self.received_end_of_stream = true;
                }
                ReadResult::Frame(frame) => self.add_ready_frame(frame),
                ReadResult::EndOfStream => {
                    tracing::debug!("End of stream received");
                    self.received_end_of_stream = true;
                }
                ReadResult::Pending => break,
                ReadResult::Error(e) => {
                    tracing::error!("Frame stream read failed: {}", e);
                    self.read_failed = true;
                    self.effects.push(Effect::Error(e));
                }
            }
        }
        self.stream = Some(stream);
    }

    fn add_ready_frame(&mut self, frame: Frame) {
        self.stats.frames_decoded += 1;
        let timestamp = frame.timestamp();

        let newest = self
            .ready
            .back()
            .map(Frame::timestamp)
            .or(self.last_painted);
        if newest.is_some_and(|newest| timestamp < newest) {
            tracing::warn!("Dropping out of order frame at {:?}", timestamp);
            self.stats.frames_dropped += 1;
            return;
        }

        if self.state == SchedulerState::Prerolling
            && !self.painted_first_frame
            && timestamp < self.start_timestamp
            && self
                .ready
                .back()
                .is_some_and(|last| last.timestamp() < self.start_timestamp)
        {
            self.ready.pop_back();
            self.stats.frames_dropped += 1;
        }

        self.ready.push_back(frame);
    }

    fn have_enough_data(&self) -> bool {
        if self.received_end_of_stream {
            return true;
        }
        if self
            .stream
            .as_ref()
            .is_some_and(|s| !s.can_read_without_stalling())
        {
            return true;
        }
        if self.ready.len() >= self.max_ready_frames {
            return true;
        }
        if self.background_rendering && !self.ready.is_empty() {
            return true;
        }
        self.low_delay && !self.ready.is_empty()
    }

    fn transition_to_have_enough(&mut self) {
        tracing::debug!("Have enough with {} frames ready", self.ready.len());
        self.state = SchedulerState::Playing;
        self.set_buffering_state(BufferingState::HaveEnough);
        if !self.painted_first_frame {
            if let Some(frame) = self.ready.pop_front() {
                self.painted_first_frame = true;
                self.paint(frame);
            }
        }
    }

    fn render(&mut self, now: Instant, clock: &dyn TimeSource) -> Option<Duration> {
        if !clock.is_time_progressing() {
            self.maybe_fire_ended();
            return None;
        }
        if self.background_rendering {
            self.remove_expired_frames(now, clock);
            self.attempt_read();
            self.maybe_fire_ended();
            return None;
        }

        let mut wait = None;
        while let Some(timestamp) = self.ready.front().map(Frame::timestamp) {
            let target = clock.wall_clock_time(timestamp);
            if now < target {
                wait = Some(target - now);
                break;
            }

            if self.drop_frames && self.ready.len() > 1 && now > self.deadline(target, clock) {
                tracing::debug!("Dropping late frame at {:?}", timestamp);
                self.last_timestamp = Some(timestamp);
                self.ready.pop_front();
                self.stats.frames_dropped += 1;
                continue;
            }

            if let Some(frame) = self.ready.pop_front() {
                self.paint(frame);
            }
            wait = self
                .ready
                .front()
                .map(|next| clock.wall_clock_time(next.timestamp()).saturating_duration_since(now));
            break;
        }

        self.attempt_read();
        self.maybe_fire_ended();
        self.maybe_underflow(now, clock);
        wait
    }

    /// Midpoint between this frame and the one after, estimated from the
    /// last frame taken off the queue, painted or dropped
    fn deadline(&self, target: Instant, clock: &dyn TimeSource) -> Instant {
        let previous = self
            .last_timestamp
            .map(|ts| clock.wall_clock_time(ts))
            .unwrap_or(target);
        target + target.saturating_duration_since(previous) / 2
    }

    fn paint(&mut self, frame: Frame) {
        let timestamp = frame.timestamp();
        if let Some(last) = self.last_painted {
            self.last_frame_duration = timestamp.saturating_sub(last);
        }
        self.last_painted = Some(timestamp);
        self.last_timestamp = Some(timestamp);

        let size = frame.natural_size();
        if self.natural_size != Some(size) {
            self.natural_size = Some(size);
            self.effects.push(Effect::NaturalSizeChanged(size));
        }
        self.stats.frames_painted += 1;
        self.effects.push(Effect::Paint(frame));
    }

    fn remove_expired_frames(&mut self, now: Instant, clock: &dyn TimeSource) {
        let mut removed = 0;
        while self.ready.len() > 1 {
            let next = clock.wall_clock_time(self.ready[1].timestamp());
            if next > now {
                break;
            }
            self.ready.pop_front();
            removed += 1;
        }
        if removed > 0 {
            tracing::debug!("Purged {} expired frames", removed);
            self.stats.frames_dropped_background += removed;
        }
    }

    fn maybe_fire_ended(&mut self) {
        if self.received_end_of_stream && !self.rendered_end_of_stream && self.ready.len() <= 1 {
            tracing::info!("Playback ended");
            self.rendered_end_of_stream = true;
            self.effects.push(Effect::Ended);
        }
    }

    fn maybe_underflow(&mut self, now: Instant, clock: &dyn TimeSource) {
        if self.buffering_state != BufferingState::HaveEnough
            || !self.ready.is_empty()
            || self.received_end_of_stream
        {
            return;
        }
        let expected_paint = self
            .last_painted
            .map(|ts| clock.wall_clock_time(ts + self.last_frame_duration));
        if expected_paint.is_some_and(|expected| now <= expected) {
            return;
        }

        tracing::debug!("Underflow, back to prerolling");
        self.set_buffering_state(BufferingState::HaveNothing);
        self.state = SchedulerState::Prerolling;
    }

    fn set_buffering_state(&mut self, state: BufferingState) {
        if self.buffering_state != state {
            self.buffering_state = state;
            self.effects.push(Effect::BufferingStateChanged(state));
        }
    }

    fn report_statistics(&mut self) {
        if self.stats != self.reported_stats {
            self.reported_stats = self.stats;
            self.effects.push(Effect::Statistics(self.stats));
        }
    }
}
