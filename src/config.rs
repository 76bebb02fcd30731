//! Configuration types for trackfeed

use crate::adapter::{ConstraintSet, MonitorSettings};
use crate::capture::{CaptureParams, ResolutionChangePolicy, MAX_FRAMES_PER_SECOND};
use crate::error::{Error, Result};
use crate::scheduler::MAX_VIDEO_FRAMES;
use crate::types::{Framerate, Size};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Everything needed to build a pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    /// Tracks opened when the pipeline runs
    pub tracks: Vec<TrackConfig>,
}

impl PipelineConfig {
    /// Read a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_preset(preset: Preset) -> Self {
        Self {
            capture: preset.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        self.scheduler.validate()?;
        self.monitor.validate()?;
        for track in &self.tracks {
            track.validate()?;
        }
        Ok(())
    }
}

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Requested frame size
    pub resolution: Size,
    /// Requested frame rate
    pub framerate: Framerate,
    /// How the device may change resolution mid-session
    pub resolution_change_policy: ResolutionChangePolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            resolution: Size::VGA,
            framerate: Framerate::FPS_30,
            resolution_change_policy: ResolutionChangePolicy::default(),
        }
    }
}

impl CaptureConfig {
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Size::new(width, height);
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.framerate = Framerate::new(fps, 1);
        self
    }

    pub fn with_policy(mut self, policy: ResolutionChangePolicy) -> Self {
        self.resolution_change_policy = policy;
        self
    }

    /// Parameters sent to the device
    pub fn params(&self) -> CaptureParams {
        CaptureParams::new(self.resolution, self.framerate.as_f64())
            .with_policy(self.resolution_change_policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution.is_empty() {
            return Err(Error::Config(format!(
                "capture resolution {} is empty",
                self.resolution
            )));
        }
        if self.framerate.den == 0 {
            return Err(Error::Config("capture framerate has a zero denominator".into()));
        }
        if self.framerate.as_f64() > MAX_FRAMES_PER_SECOND {
            return Err(Error::Config(format!(
                "capture framerate {} exceeds {} fps",
                self.framerate, MAX_FRAMES_PER_SECOND
            )));
        }
        Ok(())
    }
}

/// Frame scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ready queue capacity
    pub max_ready_frames: usize,
    /// Drop frames that missed their deadline
    pub drop_frames: bool,
    /// Start playing as soon as one frame is queued
    pub low_delay: bool,
    /// Longest the presentation thread sleeps when idle
    pub idle_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_ready_frames: MAX_VIDEO_FRAMES,
            drop_frames: true,
            low_delay: false,
            idle_interval_ms: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn with_low_delay(mut self, low_delay: bool) -> Self {
        self.low_delay = low_delay;
        self
    }

    pub fn with_drop_frames(mut self, drop_frames: bool) -> Self {
        self.drop_frames = drop_frames;
        self
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_ready_frames == 0 {
            return Err(Error::Config("scheduler.max_ready_frames must be at least 1".into()));
        }
        if self.idle_interval_ms == 0 {
            return Err(Error::Config("scheduler.idle_interval_ms must be at least 1".into()));
        }
        Ok(())
    }
}

/// Muted detection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub first_frame_timeout_intervals: u32,
    pub normal_timeout_intervals: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let settings = MonitorSettings::default();
        Self {
            enabled: true,
            first_frame_timeout_intervals: settings.first_frame_timeout_intervals,
            normal_timeout_intervals: settings.normal_timeout_intervals,
        }
    }
}

impl MonitorConfig {
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            first_frame_timeout_intervals: self.first_frame_timeout_intervals,
            normal_timeout_intervals: self.normal_timeout_intervals,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.normal_timeout_intervals == 0 {
            return Err(Error::Config("monitor.normal_timeout_intervals must be at least 1".into()));
        }
        Ok(())
    }
}

/// A track opened from configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    pub name: String,
    pub constraints: ConstraintSet,
}

impl TrackConfig {
    pub fn new(name: impl Into<String>, constraints: ConstraintSet) -> Self {
        Self {
            name: name.into(),
            constraints,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.constraints.validate()
    }
}

/// Capture presets for common device modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    /// 640x480 at 30 fps
    Vga30,
    /// 1280x720 at 30 fps
    Hd720p30,
    /// 1280x720 at 60 fps
    Hd720p60,
    /// 1920x1080 at 30 fps
    FullHd1080p30,
}

impl Preset {
    pub const ALL: [Preset; 4] = [
        Preset::Vga30,
        Preset::Hd720p30,
        Preset::Hd720p60,
        Preset::FullHd1080p30,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Vga30 => "vga30",
            Preset::Hd720p30 => "hd720p30",
            Preset::Hd720p60 => "hd720p60",
            Preset::FullHd1080p30 => "fullhd1080p30",
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vga" | "vga30" => Ok(Preset::Vga30),
            "720p" | "hd720p30" => Ok(Preset::Hd720p30),
            "720p60" | "hd720p60" => Ok(Preset::Hd720p60),
            "1080p" | "fullhd1080p30" => Ok(Preset::FullHd1080p30),
            other => Err(Error::Config(format!("unknown preset {other:?}"))),
        }
    }
}

impl From<Preset> for CaptureConfig {
    fn from(preset: Preset) -> Self {
        match preset {
            Preset::Vga30 => CaptureConfig::default(),
            Preset::Hd720p30 => CaptureConfig {
                resolution: Size::HD_720P,
                ..Default::default()
            },
            Preset::Hd720p60 => CaptureConfig {
                resolution: Size::HD_720P,
                framerate: Framerate::FPS_60,
                ..Default::default()
            },
            Preset::FullHd1080p30 => CaptureConfig {
                resolution: Size::FHD_1080P,
                ..Default::default()
            },
        }
    }
}
