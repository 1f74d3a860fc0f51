//! Screen source trait and backend selection

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::mpsc::SyncSender;
use thiserror::Error;

use super::frame::Frame;

/// Trait for screen frame sources.
///
/// A source delivers frames on its own thread into the channel handed to
/// [`ScreenSource::start`]. Dropping that channel's sender after `stop` is how
/// downstream consumers learn the source is gone.
pub trait ScreenSource: Send {
    /// Describe the source (name and delivered frame size).
    fn descriptor(&self) -> SourceDescriptor;

    /// Start capturing. Frames are sent to the provided channel.
    fn start(&mut self, tx: SyncSender<Frame>) -> Result<(), SourceError>;

    /// Stop capturing and join the capture thread.
    fn stop(&mut self);
}

/// Static description of a configured source.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("screen source unavailable: {0}")]
    Unavailable(String),
    #[error("failed to start screen source: {0}")]
    Start(String),
}

/// Which screen source backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Capture the primary display.
    #[default]
    Display,
    /// Synthesized moving test pattern (no capture permission needed).
    Pattern,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Display => write!(f, "display"),
            SourceKind::Pattern => write!(f, "pattern"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "display" => Ok(SourceKind::Display),
            "pattern" => Ok(SourceKind::Pattern),
            other => Err(format!(
                "unknown source '{other}' (expected 'display' or 'pattern')"
            )),
        }
    }
}

/// Create the configured screen source backend.
///
/// `width`/`height` are the frame dimensions the pipeline expects (already
/// rounded to even values); backends that capture at a different native size
/// adapt their frames to match.
pub fn create_screen_source(
    kind: SourceKind,
    width: u32,
    height: u32,
    fps: u32,
    show_cursor: bool,
) -> Result<Box<dyn ScreenSource>, SourceError> {
    match kind {
        SourceKind::Pattern => {
            tracing::info!("Using pattern source at {}x{}", width, height);
            Ok(Box::new(super::pattern_source::PatternSource::new(
                width, height, fps,
            )))
        }
        SourceKind::Display => {
            #[cfg(feature = "scap")]
            {
                tracing::info!("Using display capture at {}x{}", width, height);
                Ok(Box::new(super::scap_source::ScapSource::new(
                    width,
                    height,
                    fps,
                    show_cursor,
                )))
            }
            #[cfg(not(feature = "scap"))]
            {
                let _ = show_cursor;
                Err(SourceError::Unavailable(
                    "display capture requires a build with the 'scap' feature".to_string(),
                ))
            }
        }
    }
}

/// Native display bounds for pre-filling capture dimensions.
///
/// The display backend only learns its dimensions from the first captured
/// frame, so bounds are unknown before a session starts.
pub fn display_bounds(kind: SourceKind) -> Option<(u32, u32)> {
    match kind {
        SourceKind::Display => None,
        SourceKind::Pattern => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_parses_known_names() {
        assert_eq!("display".parse::<SourceKind>(), Ok(SourceKind::Display));
        assert_eq!("Pattern".parse::<SourceKind>(), Ok(SourceKind::Pattern));
        assert!("webcam".parse::<SourceKind>().is_err());
    }

    #[test]
    fn pattern_source_is_always_constructible() {
        let source = create_screen_source(SourceKind::Pattern, 64, 48, 10, true);
        assert!(source.is_ok());
    }

    #[cfg(not(feature = "scap"))]
    #[test]
    fn display_source_requires_capture_backend() {
        let err = create_screen_source(SourceKind::Display, 64, 48, 10, true)
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("scap"));
    }
}
