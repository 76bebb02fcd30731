//! Per-track adaptation constraints

use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Bounds a track puts on the frames it receives. `None` is unconstrained.
///
/// Equality is what groups tracks onto one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConstraintSet {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub min_width: Option<u32>,
    pub min_height: Option<u32>,
    pub min_aspect_ratio: Option<f64>,
    pub max_aspect_ratio: Option<f64>,
    /// Frames per second; 0 means unconstrained
    pub max_frame_rate: Option<f64>,
}

fn violation(constraint: &'static str, reason: impl Into<String>) -> Error {
    Error::ConstraintViolation {
        constraint,
        reason: reason.into(),
    }
}

fn check_ratio(key: &'static str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() => Err(violation(key, format!("{v} is not finite"))),
        Some(v) if v < 0.0 => Err(violation(key, format!("{v} is negative"))),
        _ => Ok(()),
    }
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, width: u32, height: u32) -> Self {
        self.max_width = Some(width);
        self.max_height = Some(height);
        self
    }

    pub fn with_max_width(mut self, width: u32) -> Self {
        self.max_width = Some(width);
        self
    }

    pub fn with_max_height(mut self, height: u32) -> Self {
        self.max_height = Some(height);
        self
    }

    pub fn with_min_size(mut self, width: u32, height: u32) -> Self {
        self.min_width = Some(width);
        self.min_height = Some(height);
        self
    }

    pub fn with_aspect_ratio(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_aspect_ratio = min;
        self.max_aspect_ratio = max;
        self
    }

    pub fn with_max_frame_rate(mut self, fps: f64) -> Self {
        self.max_frame_rate = Some(fps);
        self
    }

    /// True when no bound is set
    pub fn is_unconstrained(&self) -> bool {
        *self == Self::default()
    }

    /// Effective frame-rate cap, `None` when unconstrained
    pub fn frame_rate_cap(&self) -> Option<f64> {
        self.max_frame_rate.filter(|fps| *fps > 0.0)
    }

    /// Reject combinations no frame can satisfy, naming the offending key
    pub fn validate(&self) -> Result<()> {
        if self.max_width == Some(0) {
            return Err(violation("max_width", "must be positive"));
        }
        if self.max_height == Some(0) {
            return Err(violation("max_height", "must be positive"));
        }
        if let (Some(min), Some(max)) = (self.min_width, self.max_width) {
            if min > max {
                return Err(violation("min_width", format!("{min} > max_width {max}")));
            }
        }
        if let (Some(min), Some(max)) = (self.min_height, self.max_height) {
            if min > max {
                return Err(violation("min_height", format!("{min} > max_height {max}")));
            }
        }

        check_ratio("min_aspect_ratio", self.min_aspect_ratio)?;
        check_ratio("max_aspect_ratio", self.max_aspect_ratio)?;
        if self.max_aspect_ratio == Some(0.0) {
            return Err(violation("max_aspect_ratio", "must be positive"));
        }
        if let (Some(min), Some(max)) = (self.min_aspect_ratio, self.max_aspect_ratio) {
            if min > max {
                return Err(violation(
                    "min_aspect_ratio",
                    format!("{min} > max_aspect_ratio {max}"),
                ));
            }
        }

        check_ratio("max_frame_rate", self.max_frame_rate)
    }
}

impl std::fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn dim(v: Option<u32>) -> String {
            v.map_or_else(|| "*".to_string(), |v| v.to_string())
        }
        fn ratio(v: Option<f64>) -> String {
            v.map_or_else(|| "*".to_string(), |v| format!("{v:.3}"))
        }
        write!(
            f,
            "size [{}x{} .. {}x{}] aspect [{} .. {}] fps <= {}",
            dim(self.min_width),
            dim(self.min_height),
            dim(self.max_width),
            dim(self.max_height),
            ratio(self.min_aspect_ratio),
            ratio(self.max_aspect_ratio),
            ratio(self.frame_rate_cap()),
        )
    }
}
