//! Sigmoidal contrast stretch.
//!
//! Same curve as ImageMagick's `-sigmoidal-contrast SLOPE,MIDPOINT`: input is
//! normalized to `[0, 1]` over the configured dynamic range, passed through a
//! logistic curve rescaled so that 0 and 1 map onto themselves, and quantized
//! to 8 bits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// Sentinel-2 L1C quantification value: reflectance 1.0 is stored as 10000.
pub const DEFAULT_INPUT_MAX: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Midpoint {
    Raw(f64),
    Percent(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SigmaParams {
    pub slope: f64,
    pub midpoint: Midpoint,
}

impl Default for SigmaParams {
    fn default() -> Self {
        Self {
            slope: 15.0,
            midpoint: Midpoint::Percent(50.0),
        }
    }
}

impl FromStr for SigmaParams {
    type Err = FlowError;

    /// `SLOPE,MIDPOINT` with MIDPOINT raw (`2000`) or relative (`50%`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (slope, midpoint) = value
            .split_once(',')
            .ok_or_else(|| FlowError::InvalidSigma(value.to_string()))?;
        let slope: f64 = slope
            .trim()
            .parse()
            .map_err(|_| FlowError::InvalidSigma(value.to_string()))?;
        if !slope.is_finite() || slope < 0.0 {
            return Err(FlowError::InvalidSigma(value.to_string()));
        }
        let midpoint = midpoint.trim();
        let midpoint = match midpoint.strip_suffix('%') {
            Some(percent) => Midpoint::Percent(
                percent
                    .trim()
                    .parse()
                    .map_err(|_| FlowError::InvalidSigma(value.to_string()))?,
            ),
            None => Midpoint::Raw(
                midpoint
                    .parse()
                    .map_err(|_| FlowError::InvalidSigma(value.to_string()))?,
            ),
        };
        let (Midpoint::Raw(mid) | Midpoint::Percent(mid)) = midpoint;
        if !mid.is_finite() {
            return Err(FlowError::InvalidSigma(value.to_string()));
        }
        Ok(Self { slope, midpoint })
    }
}

impl fmt::Display for SigmaParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.midpoint {
            Midpoint::Raw(raw) => write!(f, "{},{}", self.slope, raw),
            Midpoint::Percent(percent) => write!(f, "{},{}%", self.slope, percent),
        }
    }
}

/// Precomputed stretch for one dynamic range.
#[derive(Debug, Clone, Copy)]
pub struct SigmoidalStretch {
    slope: f64,
    alpha: f64,
    input_max: f64,
    low: f64,
    span: f64,
}

impl SigmoidalStretch {
    pub fn new(params: SigmaParams, input_max: f64) -> Result<Self, FlowError> {
        if !(input_max > 0.0) {
            return Err(FlowError::InvalidSigma(format!(
                "input range maximum {input_max} must be positive"
            )));
        }
        let alpha = match params.midpoint {
            Midpoint::Raw(raw) => raw / input_max,
            Midpoint::Percent(percent) => percent / 100.0,
        };
        let slope = params.slope;
        let low = logistic(-slope * alpha);
        let high = logistic(slope * (1.0 - alpha));
        Ok(Self {
            slope,
            alpha,
            input_max,
            low,
            span: high - low,
        })
    }

    /// Maps a raw sample to `[0, 1]`.
    pub fn apply_unit(&self, raw: f64) -> f64 {
        let u = (raw / self.input_max).clamp(0.0, 1.0);
        if self.slope < 1e-6 || self.span <= f64::EPSILON {
            return u;
        }
        ((logistic(self.slope * (u - self.alpha)) - self.low) / self.span).clamp(0.0, 1.0)
    }

    pub fn apply(&self, raw: f64) -> u8 {
        (self.apply_unit(raw) * 255.0).round() as u8
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
