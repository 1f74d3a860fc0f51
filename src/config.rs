//! Configuration management for screenrec

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::capture::SourceKind;
use crate::encoder::EncoderKind;
use crate::params::DEFAULT_FPS;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Recording configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Notification configuration
    #[serde(default)]
    pub notification: NotificationConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Capture width in pixels (taken from the display when unset)
    pub width: Option<u32>,

    /// Capture height in pixels (taken from the display when unset)
    pub height: Option<u32>,

    /// Capture frame rate
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Output file (defaults to test.mp4 in the downloads directory)
    pub output: Option<PathBuf>,

    /// Record microphone audio alongside the screen
    #[serde(default = "default_true")]
    pub enable_audio: bool,

    /// Encoder backend
    #[serde(default)]
    pub encoder: EncoderKind,

    /// Screen source backend
    #[serde(default)]
    pub source: SourceKind,

    /// Include the cursor in the capture
    #[serde(default = "default_true")]
    pub show_cursor: bool,

    /// Explicit ffmpeg binary path (searched on PATH when unset)
    pub ffmpeg_path: Option<PathBuf>,

    /// Start recording as soon as the app launches
    #[serde(default)]
    pub autostart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Show a persistent desktop notification while recording
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions
fn default_fps() -> u32 {
    DEFAULT_FPS
}

fn default_true() -> bool {
    true
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            fps: default_fps(),
            output: None,
            enable_audio: true,
            encoder: EncoderKind::default(),
            source: SourceKind::default(),
            show_cursor: true,
            ffmpeg_path: None,
            autostart: false,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recording: RecordingConfig::default(),
            notification: NotificationConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Load from an explicit path (which must exist), or fall back to the
    /// default location, writing a starter config on first run.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read_file(path),
            None => {
                let config_path = Self::default_config_path()?;
                if config_path.exists() {
                    Self::read_file(&config_path)
                } else {
                    let config = Config::default();
                    config.save()?;
                    Ok(config)
                }
            }
        }
    }

    fn read_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = match &self.config_path {
            Some(path) => path.clone(),
            None => Self::default_config_path()?,
        };

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Path this config was loaded from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "screenrec", "screenrec")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

/// Default recording destination: `test.mp4` in the user's download
/// directory, falling back to home, then the working directory.
pub fn default_output_path() -> PathBuf {
    if let Some(dirs) = directories::UserDirs::new() {
        if let Some(download) = dirs.download_dir() {
            return download.join("test.mp4");
        }
        return dirs.home_dir().join("test.mp4");
    }
    PathBuf::from("test.mp4")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_parses_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.recording.fps, DEFAULT_FPS);
        assert!(config.recording.enable_audio);
        assert!(config.recording.show_cursor);
        assert!(!config.recording.autostart);
        assert_eq!(config.recording.encoder, EncoderKind::Auto);
        assert_eq!(config.recording.source, SourceKind::Display);
        assert!(config.notification.enabled);
    }

    #[test]
    fn partial_recording_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [recording]
            fps = 24
            width = 1920
            encoder = "software"
            "#,
        )
        .unwrap();
        assert_eq!(config.recording.fps, 24);
        assert_eq!(config.recording.width, Some(1920));
        assert_eq!(config.recording.height, None);
        assert_eq!(config.recording.encoder, EncoderKind::Software);
        assert!(config.recording.enable_audio);
    }

    #[test]
    fn default_output_is_named_test_mp4() {
        let path = default_output_path();
        assert_eq!(path.file_name().unwrap(), "test.mp4");
    }
}
