//! The assembled recording pipeline
//!
//! One pipeline owns everything a live recording needs: the virtual display
//! (source + pump), the encoder worker, and the session record. It can only
//! be built from a consent token, and teardown consumes it, so a finished
//! recording cannot be stopped twice.

use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::source::{create_screen_source, SourceError, SourceKind};
use super::virtual_display::VirtualDisplay;
use crate::consent::ConsentToken;
use crate::encoder::{
    create_encoder, AudioSource, EncodeStats, EncoderError, EncoderHandle, EncoderKind,
    EncoderSettings,
};
use crate::params::{CaptureParams, ParamError};
use crate::session::RecordingSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Recording,
    Paused,
}

/// Everything needed to assemble a pipeline, resolved by the controller.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub params: CaptureParams,
    pub source: SourceKind,
    pub encoder: EncoderKind,
    pub audio: bool,
    pub output: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    pub show_cursor: bool,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Params(#[from] ParamError),
    #[error("{0}")]
    Source(#[from] SourceError),
    #[error("{0}")]
    Encoder(#[from] EncoderError),
    #[error("could not prepare output file: {0}")]
    Output(#[from] std::io::Error),
}

pub struct CapturePipeline {
    session: RecordingSession,
    display: VirtualDisplay,
    encoder: EncoderHandle,
    encoder_name: &'static str,
    state: PipelineState,
}

impl CapturePipeline {
    /// Consume a consent token and bring up source, display, and encoder.
    ///
    /// Order matters: the encoder worker and its queue exist before the
    /// display attaches, so the first captured frame already has somewhere
    /// to go.
    pub fn build(token: ConsentToken, options: &PipelineOptions) -> Result<Self, PipelineError> {
        options.params.validate()?;
        let (width, height) = options.params.encoded_dimensions();
        let session = RecordingSession::begin(token, options.params, options.output.clone());

        prepare_output_file(&options.output)?;

        let settings = EncoderSettings {
            width,
            height,
            fps: options.params.fps,
            audio: if options.audio {
                AudioSource::Microphone
            } else {
                AudioSource::None
            },
            output: options.output.clone(),
            ffmpeg_path: options.ffmpeg_path.clone(),
        };
        let mut encoder = create_encoder(options.encoder, settings)?;
        let encoder_name = encoder.name();
        if let Err(e) = encoder.prepare() {
            encoder.abort();
            return Err(e.into());
        }
        if let Err(e) = encoder.start() {
            encoder.abort();
            return Err(e.into());
        }
        let handle = EncoderHandle::spawn(encoder)?;

        let source = match create_screen_source(
            options.source,
            width,
            height,
            options.params.fps,
            options.show_cursor,
        ) {
            Ok(source) => source,
            Err(e) => {
                handle.abort();
                return Err(e.into());
            }
        };

        let surface = handle.surface()?;
        let events = handle.event_queue()?;
        let display = match VirtualDisplay::attach(source, surface, events) {
            Ok(display) => display,
            Err(e) => {
                handle.abort();
                return Err(e.into());
            }
        };

        info!(
            session = %session.session_id(),
            output = %options.output.display(),
            encoder = encoder_name,
            size = %format!("{width}x{height}"),
            fps = options.params.fps,
            "recording pipeline started"
        );
        Ok(Self {
            session,
            display,
            encoder: handle,
            encoder_name,
            state: PipelineState::Recording,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session.session_id()
    }

    /// Detach the surface, then gate the encoder. New frames die at the
    /// detached display; frames already queued still encode.
    pub fn pause(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Recording {
            debug!("pipeline is already paused");
            return Ok(());
        }
        self.display.set_surface(None);
        self.encoder.pause()?;
        self.state = PipelineState::Paused;
        info!(session = %self.session.session_id(), "recording paused");
        Ok(())
    }

    /// Reattach the surface, then lift the encoder gate. Frames racing the
    /// gate are shed by the worker, never encoded out of order.
    pub fn resume(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Paused {
            debug!("pipeline is not paused");
            return Ok(());
        }
        self.display.set_surface(Some(self.encoder.surface()?));
        self.encoder.resume()?;
        self.state = PipelineState::Recording;
        info!(session = %self.session.session_id(), "recording resumed");
        Ok(())
    }

    /// Tear down in order: stop the source, drain the pump, finish the
    /// encoder through its queue, then write the session sidecar.
    pub fn shutdown(self) -> Result<EncodeStats, PipelineError> {
        let dropped = self.display.release();
        let mut stats = self.encoder.finish()?;
        stats.dropped += dropped;

        if let Err(e) = self.session.write_sidecar(&stats, self.encoder_name) {
            warn!("could not write session sidecar: {e:#}");
        }
        info!(
            session = %self.session.session_id(),
            frames = stats.frames,
            dropped = stats.dropped,
            bytes = stats.bytes,
            duration_ms = stats.duration.as_millis() as u64,
            "recording finished"
        );
        Ok(stats)
    }
}

/// Remove a stale output file and make sure the directory exists and is
/// writable before anything heavier starts.
fn prepare_output_file(path: &Path) -> Result<(), PipelineError> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale output file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(PipelineError::Output(e)),
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    File::create(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_output(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "screenrec-pipeline-{tag}-{}.mp4",
            uuid::Uuid::new_v4()
        ))
    }

    fn options(output: PathBuf, width: u32, height: u32) -> PipelineOptions {
        PipelineOptions {
            params: CaptureParams::new(width, height, 30).unwrap(),
            source: SourceKind::Pattern,
            encoder: EncoderKind::Software,
            audio: false,
            output,
            ffmpeg_path: None,
            show_cursor: false,
        }
    }

    #[test]
    fn records_pauses_and_finishes_a_playable_file() {
        let output = temp_output("full");
        let token = ConsentToken::grant(SourceKind::Pattern);
        let session_id = token.session_id();

        let mut pipeline =
            CapturePipeline::build(token, &options(output.clone(), 320, 240)).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Recording);
        let clock = std::time::Instant::now();

        std::thread::sleep(Duration::from_millis(200));
        pipeline.pause().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Paused);
        std::thread::sleep(Duration::from_millis(400));
        pipeline.resume().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Recording);
        std::thread::sleep(Duration::from_millis(200));

        let stats = pipeline.shutdown().unwrap();
        let wall = clock.elapsed();
        assert!(stats.frames > 0);
        assert!(stats.bytes > 0);
        assert!(stats.duration > Duration::ZERO);
        // Media time only advances for delivered frames, so the paused
        // interval must be missing from the output duration.
        assert!(
            stats.duration + Duration::from_millis(200) < wall,
            "output duration {:?} should exclude the pause (wall {:?})",
            stats.duration,
            wall
        );

        let file = File::open(&output).unwrap();
        let size = file.metadata().unwrap().len();
        let reader = mp4::Mp4Reader::read_header(std::io::BufReader::new(file), size).unwrap();
        let track = reader.tracks().values().next().unwrap();
        assert_eq!(track.width(), 320);
        assert_eq!(track.height(), 240);

        let sidecar = PathBuf::from(format!("{}.json", output.display()));
        let raw = std::fs::read_to_string(&sidecar).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["session_id"], session_id.to_string());

        let _ = std::fs::remove_file(&output);
        let _ = std::fs::remove_file(&sidecar);
    }

    #[test]
    fn pause_and_resume_are_idempotent_per_state() {
        let output = temp_output("idem");
        let token = ConsentToken::grant(SourceKind::Pattern);
        let mut pipeline =
            CapturePipeline::build(token, &options(output.clone(), 64, 48)).unwrap();

        pipeline.resume().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Recording);
        pipeline.pause().unwrap();
        pipeline.pause().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Paused);

        pipeline.shutdown().unwrap();
        let _ = std::fs::remove_file(format!("{}.json", output.display()));
        let _ = std::fs::remove_file(&output);
    }

    #[test]
    fn odd_dimensions_are_evened_before_the_encoder_sees_them() {
        let output = temp_output("odd");
        let token = ConsentToken::grant(SourceKind::Pattern);
        let pipeline =
            CapturePipeline::build(token, &options(output.clone(), 319, 239)).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        let stats = pipeline.shutdown().unwrap();
        assert!(stats.frames > 0);

        let file = File::open(&output).unwrap();
        let size = file.metadata().unwrap().len();
        let reader = mp4::Mp4Reader::read_header(std::io::BufReader::new(file), size).unwrap();
        let track = reader.tracks().values().next().unwrap();
        assert_eq!(track.width(), 320);
        assert_eq!(track.height(), 240);

        let _ = std::fs::remove_file(format!("{}.json", output.display()));
        let _ = std::fs::remove_file(&output);
    }

    #[test]
    fn fallback_bounds_record_through_the_software_encoder() {
        // 1920x1080 is even but 1080 is not a whole number of macroblocks;
        // the default bounds must still produce a playable file.
        let output = temp_output("bounds");
        let token = ConsentToken::grant(SourceKind::Pattern);
        let (width, height) = crate::params::FALLBACK_BOUNDS;

        let pipeline =
            CapturePipeline::build(token, &options(output.clone(), width, height)).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        let stats = pipeline.shutdown().unwrap();
        assert!(stats.frames > 0);

        let file = File::open(&output).unwrap();
        let size = file.metadata().unwrap().len();
        let reader = mp4::Mp4Reader::read_header(std::io::BufReader::new(file), size).unwrap();
        let track = reader.tracks().values().next().unwrap();
        assert_eq!(u32::from(track.width()), width);
        assert_eq!(u32::from(track.height()), height);

        let _ = std::fs::remove_file(format!("{}.json", output.display()));
        let _ = std::fs::remove_file(&output);
    }

    #[test]
    fn stale_output_is_replaced_not_appended() {
        let output = temp_output("stale");
        std::fs::write(&output, b"not an mp4").unwrap();

        let token = ConsentToken::grant(SourceKind::Pattern);
        let pipeline =
            CapturePipeline::build(token, &options(output.clone(), 64, 48)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let stats = pipeline.shutdown().unwrap();
        assert!(stats.bytes > 0);

        let file = File::open(&output).unwrap();
        let size = file.metadata().unwrap().len();
        assert!(mp4::Mp4Reader::read_header(std::io::BufReader::new(file), size).is_ok());

        let _ = std::fs::remove_file(format!("{}.json", output.display()));
        let _ = std::fs::remove_file(&output);
    }
}
