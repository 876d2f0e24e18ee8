//! Time representation for frame-accurate playback
//!
//! Timeline positions travel through the pipeline as `f64` seconds because
//! they come from a wall clock. Whenever a position must become an identity
//! (cache keys, frame numbers) it is snapped to a frame boundary with
//! rational arithmetic so that float jitter cannot split one frame into two.

use num_rational::Rational64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A rational time value representing a point in time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RationalTime {
    /// Time value as a rational number (seconds)
    value: Rational64,
}

impl RationalTime {
    /// The time is `numerator / denominator` seconds.
    #[inline]
    pub fn new(numerator: i64, denominator: i64) -> Self {
        Self {
            value: Rational64::new(numerator, denominator),
        }
    }

    /// Create a RationalTime from a frame number and frame rate.
    #[inline]
    pub fn from_frames(frames: i64, rate: FrameRate) -> Self {
        Self {
            value: Rational64::new(frames * rate.denominator as i64, rate.numerator as i64),
        }
    }

    /// Convert to seconds as f64.
    #[inline]
    pub fn to_seconds_f64(self) -> f64 {
        *self.value.numer() as f64 / *self.value.denom() as f64
    }

    /// Floor to a frame number at the given frame rate.
    #[inline]
    pub fn to_frames(self, rate: FrameRate) -> i64 {
        let frames =
            self.value * Rational64::new(rate.numerator as i64, rate.denominator as i64);
        frames.floor().to_integer()
    }
}

impl fmt::Display for RationalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.to_seconds_f64())
    }
}

/// Frame rate as a rational number (e.g., 24000/1001 for 23.976 fps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    /// Numerator (e.g., 24000)
    pub numerator: u32,
    /// Denominator (e.g., 1001)
    pub denominator: u32,
}

impl FrameRate {
    #[inline]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Convert to frames per second as f64.
    #[inline]
    pub fn to_fps_f64(self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Duration of a single frame in seconds.
    #[inline]
    pub fn frame_duration_secs(self) -> f64 {
        self.denominator as f64 / self.numerator as f64
    }

    /// Nearest frame number for a position in seconds: `round(t * fps)`.
    pub fn nearest_frame(self, seconds: f64) -> i64 {
        (seconds * self.numerator as f64 / self.denominator as f64).round() as i64
    }

    /// Exact start time of a frame number, in seconds.
    pub fn frame_start_secs(self, frame: i64) -> f64 {
        RationalTime::from_frames(frame, self).to_seconds_f64()
    }

    /// Snap a position to the nearest frame boundary.
    pub fn quantize(self, seconds: f64) -> f64 {
        self.frame_start_secs(self.nearest_frame(seconds))
    }

    pub fn is_valid(self) -> bool {
        self.numerator > 0 && self.denominator > 0
    }

    /// Common frame rates
    pub const FPS_23_976: Self = Self::new(24000, 1001);
    pub const FPS_24: Self = Self::new(24, 1);
    pub const FPS_25: Self = Self::new(25, 1);
    pub const FPS_29_97: Self = Self::new(30000, 1001);
    pub const FPS_30: Self = Self::new(30, 1);
    pub const FPS_60: Self = Self::new(60, 1);
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::FPS_30
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fps = self.to_fps_f64();
        if (fps - fps.round()).abs() < 0.001 {
            write!(f, "{} fps", fps.round() as u32)
        } else {
            write!(f, "{:.3} fps", fps)
        }
    }
}
