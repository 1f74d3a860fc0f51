//! Capture parameter validation

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default frame rate when the user supplies none.
pub const DEFAULT_FPS: u32 = 60;

/// Fallback display bounds used when the active source cannot report its own.
pub const FALLBACK_BOUNDS: (u32, u32) = (1920, 1080);

/// User-supplied capture parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("width must be a positive integer (got {0})")]
    InvalidWidth(u32),
    #[error("height must be a positive integer (got {0})")]
    InvalidHeight(u32),
    #[error("frame rate must be a positive integer (got {0})")]
    InvalidFps(u32),
}

impl CaptureParams {
    /// Create validated parameters.
    pub fn new(width: u32, height: u32, fps: u32) -> Result<Self, ParamError> {
        let params = Self { width, height, fps };
        params.validate()?;
        Ok(params)
    }

    /// Reject zero values with an error naming the offending field.
    pub fn validate(&self) -> Result<(), ParamError> {
        if self.width == 0 {
            return Err(ParamError::InvalidWidth(self.width));
        }
        if self.height == 0 {
            return Err(ParamError::InvalidHeight(self.height));
        }
        if self.fps == 0 {
            return Err(ParamError::InvalidFps(self.fps));
        }
        Ok(())
    }

    /// Dimensions rounded up to even values, as required for 4:2:0 encoding.
    pub fn encoded_dimensions(&self) -> (u32, u32) {
        (make_even(self.width), make_even(self.height))
    }
}

impl std::fmt::Display for CaptureParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}fps", self.width, self.height, self.fps)
    }
}

fn make_even(v: u32) -> u32 {
    if v % 2 == 0 {
        v
    } else {
        v.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_positive_triples() {
        assert!(CaptureParams::new(1280, 720, 30).is_ok());
        assert!(CaptureParams::new(1, 1, 1).is_ok());
    }

    #[test]
    fn rejects_zero_fields_naming_the_field() {
        assert_eq!(
            CaptureParams::new(0, 720, 30),
            Err(ParamError::InvalidWidth(0))
        );
        assert_eq!(
            CaptureParams::new(1280, 0, 30),
            Err(ParamError::InvalidHeight(0))
        );
        assert_eq!(
            CaptureParams::new(1280, 720, 0),
            Err(ParamError::InvalidFps(0))
        );
    }

    #[test]
    fn encoded_dimensions_round_odd_values_up() {
        let params = CaptureParams::new(1279, 719, 30).unwrap();
        assert_eq!(params.encoded_dimensions(), (1280, 720));

        let even = CaptureParams::new(1280, 720, 30).unwrap();
        assert_eq!(even.encoded_dimensions(), (1280, 720));
    }
}
