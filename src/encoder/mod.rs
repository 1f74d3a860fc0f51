//! Media encoders and the encode worker
//!
//! An [`Encoder`] turns raw frames into an MPEG-4 file. Encoders run on a
//! dedicated worker thread that drains a single ordered message queue; the
//! queue also carries pause/resume control and display callback events, so
//! everything that touches an encoder happens on one thread.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::capture::{DisplayEvent, Frame};

pub mod ffmpeg;
pub mod software;

pub use ffmpeg::FfmpegEncoder;
pub use software::SoftwareEncoder;

/// Messages drained by the encode worker, in order.
pub(crate) enum WorkerMsg {
    Frame(Frame),
    Pause,
    Resume,
    Display(DisplayEvent),
    Finish(SyncSender<Result<EncodeStats, EncoderError>>),
}

/// Depth of the worker queue. Frames beyond this are dropped at the surface.
const WORKER_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mp4 container error: {0}")]
    Container(#[from] mp4::Error),
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("failed to finalize recording: {0}")]
    Finalize(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("encoder worker is gone")]
    WorkerGone,
}

/// Where audio comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    None,
    Microphone,
}

/// Concrete encoder configuration, derived from capture parameters.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    /// Output width (even).
    pub width: u32,
    /// Output height (even).
    pub height: u32,
    pub fps: u32,
    pub audio: AudioSource,
    pub output: PathBuf,
    /// Explicit ffmpeg binary; `None` searches PATH.
    pub ffmpeg_path: Option<PathBuf>,
}

/// Counters reported when an encoder finishes.
#[derive(Debug, Clone, Default)]
pub struct EncodeStats {
    pub frames: u64,
    /// Frames discarded because the worker queue was full.
    pub dropped: u64,
    pub bytes: u64,
    pub duration: Duration,
}

/// A video/audio encoder producing a single MPEG-4 file.
///
/// Lifecycle: `prepare` -> `start` -> (`write_frame` | `pause` | `resume`)* ->
/// `finish` or `abort`. After `start`, all calls happen on the worker thread.
pub trait Encoder: Send {
    fn name(&self) -> &'static str;

    /// Open the output sink (spawn the subprocess, write container headers).
    fn prepare(&mut self) -> Result<(), EncoderError>;

    /// Begin accepting frames.
    fn start(&mut self) -> Result<(), EncoderError>;

    fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError>;

    fn pause(&mut self) -> Result<(), EncoderError>;

    fn resume(&mut self) -> Result<(), EncoderError>;

    /// Finalize the container and return stats.
    fn finish(self: Box<Self>) -> Result<EncodeStats, EncoderError>;

    /// Discard the recording, removing partial output.
    fn abort(self: Box<Self>);
}

/// Which encoder backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// ffmpeg when available, otherwise the software encoder.
    #[default]
    Auto,
    Ffmpeg,
    Software,
}

impl std::fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderKind::Auto => write!(f, "auto"),
            EncoderKind::Ffmpeg => write!(f, "ffmpeg"),
            EncoderKind::Software => write!(f, "software"),
        }
    }
}

impl FromStr for EncoderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(EncoderKind::Auto),
            "ffmpeg" => Ok(EncoderKind::Ffmpeg),
            "software" => Ok(EncoderKind::Software),
            other => Err(format!(
                "unknown encoder '{other}' (expected 'auto', 'ffmpeg' or 'software')"
            )),
        }
    }
}

/// Create the configured encoder backend.
pub fn create_encoder(
    kind: EncoderKind,
    settings: EncoderSettings,
) -> Result<Box<dyn Encoder>, EncoderError> {
    match kind {
        EncoderKind::Ffmpeg => Ok(Box::new(FfmpegEncoder::new(settings))),
        EncoderKind::Software => Ok(Box::new(SoftwareEncoder::new(settings))),
        EncoderKind::Auto => {
            if ffmpeg::available(settings.ffmpeg_path.as_deref()) {
                debug!("auto-selected ffmpeg encoder");
                Ok(Box::new(FfmpegEncoder::new(settings)))
            } else {
                warn!("ffmpeg not found on PATH, falling back to the software encoder");
                Ok(Box::new(SoftwareEncoder::new(settings)))
            }
        }
    }
}

/// Frame sink handed to the mirrored display. Clones share the worker queue.
#[derive(Clone)]
pub struct Surface {
    tx: SyncSender<WorkerMsg>,
}

/// Outcome of pushing one frame into the worker queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Queued,
    QueueFull,
    Disconnected,
}

impl Surface {
    pub fn push_frame(&self, frame: Frame) -> PushStatus {
        match self.tx.try_send(WorkerMsg::Frame(frame)) {
            Ok(()) => PushStatus::Queued,
            Err(TrySendError::Full(_)) => PushStatus::QueueFull,
            Err(TrySendError::Disconnected(_)) => PushStatus::Disconnected,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_queue(depth: usize) -> (Surface, SyncSender<WorkerMsg>, Receiver<WorkerMsg>) {
    let (tx, rx) = sync_channel(depth);
    (Surface { tx: tx.clone() }, tx, rx)
}

#[cfg(test)]
pub(crate) fn surface_for_tests(tx: SyncSender<WorkerMsg>) -> Surface {
    Surface { tx }
}

/// Owns the encode worker thread and its queue.
///
/// `finish` consumes the handle, so the release sequence can only run once.
/// Dropping an unfinished handle closes the queue, which makes the worker
/// abort and discard its partial output.
pub struct EncoderHandle {
    tx: Option<SyncSender<WorkerMsg>>,
    worker: Option<JoinHandle<()>>,
}

impl EncoderHandle {
    /// Move a prepared, started encoder onto a fresh worker thread.
    pub fn spawn(encoder: Box<dyn Encoder>) -> Result<Self, EncoderError> {
        let (tx, rx) = sync_channel(WORKER_QUEUE_DEPTH);
        let worker = std::thread::Builder::new()
            .name("encode-worker".to_string())
            .spawn(move || encode_worker(encoder, rx))?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Mint a surface feeding this worker's queue.
    pub fn surface(&self) -> Result<Surface, EncoderError> {
        let tx = self.tx.as_ref().ok_or(EncoderError::WorkerGone)?.clone();
        Ok(Surface { tx })
    }

    /// Sender for display callback events, sharing the frame queue ordering.
    pub(crate) fn event_queue(&self) -> Result<SyncSender<WorkerMsg>, EncoderError> {
        Ok(self.tx.as_ref().ok_or(EncoderError::WorkerGone)?.clone())
    }

    pub fn pause(&self) -> Result<(), EncoderError> {
        self.send(WorkerMsg::Pause)
    }

    pub fn resume(&self) -> Result<(), EncoderError> {
        self.send(WorkerMsg::Resume)
    }

    fn send(&self, msg: WorkerMsg) -> Result<(), EncoderError> {
        self.tx
            .as_ref()
            .ok_or(EncoderError::WorkerGone)?
            .send(msg)
            .map_err(|_| EncoderError::WorkerGone)
    }

    /// Drain the queue, finalize the container, join the worker.
    pub fn finish(mut self) -> Result<EncodeStats, EncoderError> {
        let tx = self.tx.take().ok_or(EncoderError::WorkerGone)?;
        let (reply_tx, reply_rx) = sync_channel(1);
        tx.send(WorkerMsg::Finish(reply_tx))
            .map_err(|_| EncoderError::WorkerGone)?;
        drop(tx);

        let result = reply_rx.recv().map_err(|_| EncoderError::WorkerGone);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("encode worker panicked during finish");
            }
        }
        result?
    }

    /// Abandon the recording: close the queue and let the worker discard.
    pub fn abort(mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for EncoderHandle {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// The worker loop: drains the queue in order until `Finish` arrives or every
/// sender is gone. The first encode error is kept and reported at finish;
/// later frames are skipped. Frames that race a pause are discarded.
fn encode_worker(mut encoder: Box<dyn Encoder>, rx: Receiver<WorkerMsg>) {
    let mut paused = false;
    let mut failure: Option<EncoderError> = None;

    loop {
        match rx.recv() {
            Ok(WorkerMsg::Frame(frame)) => {
                if paused || failure.is_some() {
                    continue;
                }
                if let Err(e) = encoder.write_frame(&frame) {
                    warn!("frame encode failed: {e}");
                    failure = Some(e);
                }
            }
            Ok(WorkerMsg::Pause) => {
                if let Err(e) = encoder.pause() {
                    warn!("encoder pause failed: {e}");
                    failure.get_or_insert(e);
                }
                paused = true;
            }
            Ok(WorkerMsg::Resume) => {
                if let Err(e) = encoder.resume() {
                    warn!("encoder resume failed: {e}");
                    failure.get_or_insert(e);
                }
                paused = false;
            }
            Ok(WorkerMsg::Display(event)) => {
                debug!(?event, "display callback");
            }
            Ok(WorkerMsg::Finish(reply)) => {
                let result = match failure.take() {
                    Some(e) => {
                        encoder.abort();
                        Err(e)
                    }
                    None => encoder.finish(),
                };
                let _ = reply.send(result);
                return;
            }
            Err(_) => {
                debug!("worker queue closed without finish, discarding recording");
                encoder.abort();
                return;
            }
        }
    }
}
