//! Fade curve definitions for volume ramps
//!
//! A fade moves a gain from its current value to a target over a fixed
//! duration. Two ramp shapes are supported, matching what audio backends
//! expose for scheduled parameter automation:
//! - Linear: v(p) = from + (to - from) × p
//! - Exponential: v(p) = from × (to / from)^p
//!
//! Exponential ramps are undefined through zero, so both endpoints are
//! floored at [`EXPONENTIAL_FLOOR`] before interpolation. A ramp that ends
//! at exactly zero still reports zero once complete.

use serde::{Deserialize, Serialize};

/// Smallest magnitude used as an exponential ramp endpoint
pub const EXPONENTIAL_FLOOR: f32 = 1.0e-4;

/// Volume ramp shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FadeCurve {
    /// Constant rate of change
    #[default]
    Linear,

    /// Constant ratio of change per unit time (perceptually even)
    Exponential,
}

impl FadeCurve {
    /// Value of a ramp from `from` to `to` at normalized `progress`
    ///
    /// # Arguments
    /// * `from` - Gain at the start of the ramp
    /// * `to` - Gain at the end of the ramp
    /// * `progress` - Normalized position through the ramp (clamped to 0.0..=1.0)
    pub fn interpolate(&self, from: f32, to: f32, progress: f32) -> f32 {
        let p = progress.clamp(0.0, 1.0);
        if p >= 1.0 {
            return to;
        }

        match self {
            FadeCurve::Linear => from + (to - from) * p,
            FadeCurve::Exponential => {
                let start = from.max(EXPONENTIAL_FLOOR);
                let end = to.max(EXPONENTIAL_FLOOR);
                start * (end / start).powf(p)
            }
        }
    }

    /// Parse curve from its configuration name (case insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Some(FadeCurve::Linear),
            "exponential" | "exp" => Some(FadeCurve::Exponential),
            _ => None,
        }
    }

    /// Canonical configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "linear",
            FadeCurve::Exponential => "exponential",
        }
    }
}

impl std::fmt::Display for FadeCurve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
