use clap::Parser;
use std::path::PathBuf;

use crate::capture::SourceKind;
use crate::encoder::EncoderKind;

#[derive(Debug, Parser)]
#[command(
    name = "screenrec",
    about = "Records the screen and microphone to an MPEG-4 file",
    version
)]
pub struct Cli {
    /// Capture width in pixels (defaults to the source bounds).
    #[arg(long)]
    pub width: Option<u32>,

    /// Capture height in pixels (defaults to the source bounds).
    #[arg(long)]
    pub height: Option<u32>,

    /// Target frame rate.
    #[arg(long)]
    pub fps: Option<u32>,

    /// Output file path (will be overwritten).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Capture source: display or pattern.
    #[arg(long)]
    pub source: Option<SourceKind>,

    /// Encoder backend: auto, ffmpeg or software.
    #[arg(long)]
    pub encoder: Option<EncoderKind>,

    /// Record video only, without the microphone track.
    #[arg(long)]
    pub no_audio: bool,

    /// Start recording immediately instead of waiting for `start`.
    #[arg(long)]
    pub autostart: bool,

    /// Record for this many seconds, then stop and exit.
    #[arg(long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Suppress the recording-in-progress desktop notification.
    #[arg(long)]
    pub no_notify: bool,

    /// Path to a config file (defaults to the per-user location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,
}
