//! Playback clocks
//!
//! The scheduler never reads the system clock for media time directly. It
//! asks a [`TimeSource`] what the media time is and when a given media
//! timestamp falls on the wall clock.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Playback clock consulted by the scheduler
pub trait TimeSource: Send + Sync {
    /// Current media time
    fn media_time(&self) -> Duration;

    /// Wall-clock instant at which `media_time` is due
    fn wall_clock_time(&self, media_time: Duration) -> Instant;

    fn is_time_progressing(&self) -> bool;
}

fn offset(reference: Instant, from: Duration, to: Duration, rate: f64) -> Instant {
    if to >= from {
        reference + (to - from).div_f64(rate)
    } else {
        let back = (from - to).div_f64(rate);
        reference.checked_sub(back).unwrap_or(reference)
    }
}

#[derive(Debug)]
struct ClockState {
    base_media_time: Duration,
    /// Set while ticking
    base_instant: Option<Instant>,
    playback_rate: f64,
}

/// Media time advancing with the monotonic system clock
#[derive(Debug)]
pub struct WallClockTimeSource {
    state: Mutex<ClockState>,
}

impl Default for WallClockTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClockTimeSource {
    /// A stopped clock at media time zero
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                base_media_time: Duration::ZERO,
                base_instant: None,
                playback_rate: 1.0,
            }),
        }
    }

    pub fn start_ticking(&self) {
        let mut state = self.state.lock();
        if state.base_instant.is_none() {
            state.base_instant = Some(Instant::now());
        }
    }

    pub fn stop_ticking(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.base_media_time = Self::media_time_at(&state, now);
        state.base_instant = None;
    }

    /// Jump to `media_time`; only allowed while stopped
    pub fn set_media_time(&self, media_time: Duration) {
        let mut state = self.state.lock();
        debug_assert!(state.base_instant.is_none(), "seek while ticking");
        state.base_media_time = media_time;
    }

    /// Non-positive or non-finite rates are ignored
    pub fn set_playback_rate(&self, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            tracing::warn!("Ignoring playback rate {}", rate);
            return;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.base_instant.is_some() {
            state.base_media_time = Self::media_time_at(&state, now);
            state.base_instant = Some(now);
        }
        state.playback_rate = rate;
    }

    fn media_time_at(state: &ClockState, now: Instant) -> Duration {
        match state.base_instant {
            Some(base) => {
                state.base_media_time
                    + now.saturating_duration_since(base).mul_f64(state.playback_rate)
            }
            None => state.base_media_time,
        }
    }
}

impl TimeSource for WallClockTimeSource {
    fn media_time(&self) -> Duration {
        Self::media_time_at(&self.state.lock(), Instant::now())
    }

    fn wall_clock_time(&self, media_time: Duration) -> Instant {
        let state = self.state.lock();
        match state.base_instant {
            Some(base) => offset(base, state.base_media_time, media_time, state.playback_rate),
            None => offset(Instant::now(), state.base_media_time, media_time, state.playback_rate),
        }
    }

    fn is_time_progressing(&self) -> bool {
        self.state.lock().base_instant.is_some()
    }
}

/// Clock moved by hand, mapping media time `t` to `origin + t`
#[derive(Debug)]
pub struct ManualTimeSource {
    origin: Instant,
    media_time: Mutex<Duration>,
    progressing: Mutex<bool>,
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            media_time: Mutex::new(Duration::ZERO),
            progressing: Mutex::new(true),
        }
    }

    /// Wall-clock instant matching the current media time
    pub fn now(&self) -> Instant {
        self.origin + *self.media_time.lock()
    }

    pub fn set_media_time(&self, media_time: Duration) {
        *self.media_time.lock() = media_time;
    }

    pub fn advance(&self, by: Duration) {
        *self.media_time.lock() += by;
    }

    pub fn set_progressing(&self, progressing: bool) {
        *self.progressing.lock() = progressing;
    }
}

impl TimeSource for ManualTimeSource {
    fn media_time(&self) -> Duration {
        *self.media_time.lock()
    }

    fn wall_clock_time(&self, media_time: Duration) -> Instant {
        self.origin + media_time
    }

    fn is_time_progressing(&self) -> bool {
        *self.progressing.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_clock_holds_media_time() {
        let clock = WallClockTimeSource::new();
        clock.set_media_time(Duration::from_secs(2));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.media_time(), Duration::from_secs(2));
        assert!(!clock.is_time_progressing());
    }

    #[test]
    fn ticking_clock_maps_media_to_wall_time() {
        let clock = WallClockTimeSource::new();
        clock.start_ticking();
        let due = clock.wall_clock_time(Duration::from_millis(500));
        let now = Instant::now();
        assert!(due > now);
        assert!(due - now <= Duration::from_millis(500));

        std::thread::sleep(Duration::from_millis(10));
        clock.stop_ticking();
        let paused_at = clock.media_time();
        assert!(paused_at >= Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.media_time(), paused_at);
    }

    #[test]
    fn double_rate_halves_wall_distance() {
        let clock = WallClockTimeSource::new();
        clock.set_playback_rate(2.0);
        clock.set_playback_rate(-1.0);
        let before = Instant::now();
        let due = clock.wall_clock_time(Duration::from_secs(2));
        assert!(due - before <= Duration::from_millis(1010));
        assert!(due - before >= Duration::from_millis(990));
    }

    #[test]
    fn manual_clock_is_deterministic() {
        let clock = ManualTimeSource::new();
        clock.advance(Duration::from_millis(40));
        assert_eq!(
            clock.wall_clock_time(Duration::from_millis(40)),
            clock.now()
        );
        assert_eq!(clock.media_time(), Duration::from_millis(40));
    }
}
