//! ffmpeg subprocess encoder
//!
//! Pipes raw BGRA frames into an ffmpeg child process over stdin and lets it
//! do H.264 + AAC + MP4 muxing. This is the preferred backend when the binary
//! is present: real compression, and the only one with a microphone path.

use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AudioSource, EncodeStats, Encoder, EncoderError, EncoderSettings};
use crate::capture::{Frame, PixelFormat};

/// Probe whether ffmpeg can be executed.
pub fn available(path: Option<&Path>) -> bool {
    Command::new(resolve_binary(path))
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn resolve_binary(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("ffmpeg"))
}

/// Default microphone input for this platform, if one can be addressed
/// without any configuration.
fn audio_input_args() -> Option<[&'static str; 4]> {
    #[cfg(target_os = "linux")]
    {
        Some(["-f", "pulse", "-i", "default"])
    }
    #[cfg(target_os = "macos")]
    {
        Some(["-f", "avfoundation", "-i", ":0"])
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

/// Everything up to (but not including) the output path.
fn build_args(settings: &EncoderSettings, audio_active: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "bgra".into(),
        "-s".into(),
        format!("{}x{}", settings.width, settings.height),
        "-r".into(),
        settings.fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
    ];
    if audio_active {
        if let Some(audio) = audio_input_args() {
            args.extend(audio.iter().map(|s| s.to_string()));
        }
    }
    args.extend(
        [
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-crf",
            "23",
            "-tune",
            "stillimage",
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "+faststart",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    if audio_active {
        args.extend(
            ["-c:a", "aac", "-b:a", "160k", "-shortest"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
    args
}

pub struct FfmpegEncoder {
    settings: EncoderSettings,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    frames: u64,
    audio_active: bool,
    #[cfg(unix)]
    suspended: bool,
}

impl FfmpegEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings,
            child: None,
            stdin: None,
            frames: 0,
            audio_active: false,
            #[cfg(unix)]
            suspended: false,
        }
    }

    #[cfg(unix)]
    fn signal_child(&self, signal: libc::c_int) -> Result<(), EncoderError> {
        let child = self
            .child
            .as_ref()
            .ok_or_else(|| EncoderError::Encode("ffmpeg is not running".to_string()))?;
        let rc = unsafe { libc::kill(child.id() as libc::pid_t, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(EncoderError::Encode(format!(
                "failed to signal ffmpeg: {}",
                std::io::Error::last_os_error()
            )))
        }
    }

    #[cfg(unix)]
    fn resume_if_suspended(&mut self) {
        if self.suspended {
            if let Err(e) = self.signal_child(libc::SIGCONT) {
                warn!("could not resume suspended ffmpeg: {e}");
            }
            self.suspended = false;
        }
    }

    #[cfg(not(unix))]
    fn resume_if_suspended(&mut self) {}
}

impl Encoder for FfmpegEncoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn prepare(&mut self) -> Result<(), EncoderError> {
        self.audio_active =
            self.settings.audio == AudioSource::Microphone && audio_input_args().is_some();
        if self.settings.audio == AudioSource::Microphone && !self.audio_active {
            warn!("no default microphone input on this platform, recording video only");
        }

        let binary = resolve_binary(self.settings.ffmpeg_path.as_deref());
        let args = build_args(&self.settings, self.audio_active);
        info!(
            binary = %binary.display(),
            size = %format!("{}x{}", self.settings.width, self.settings.height),
            fps = self.settings.fps,
            audio = self.audio_active,
            "spawning ffmpeg"
        );

        let mut child = Command::new(&binary)
            .args(&args)
            .arg(&self.settings.output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EncoderError::Spawn(format!("{}: {e}", binary.display())))?;

        self.stdin = child.stdin.take();
        if self.stdin.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EncoderError::Spawn(
                "ffmpeg stdin was not captured".to_string(),
            ));
        }
        self.child = Some(child);
        Ok(())
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        debug!("ffmpeg encoder accepting frames");
        Ok(())
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        use std::io::Write;

        if !frame.is_complete() {
            warn!(len = frame.data.len(), "skipping incomplete frame");
            return Ok(());
        }
        if frame.width != self.settings.width || frame.height != self.settings.height {
            warn!(
                got = %format!("{}x{}", frame.width, frame.height),
                want = %format!("{}x{}", self.settings.width, self.settings.height),
                "skipping frame with unexpected dimensions"
            );
            return Ok(());
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EncoderError::Encode("ffmpeg stdin is closed".to_string()))?;
        // The pipe was declared bgra at spawn time.
        match frame.pixel_format {
            PixelFormat::Bgra8888 => stdin.write_all(&frame.data)?,
            PixelFormat::Rgba8888 => {
                let mut bgra = frame.data.clone();
                for px in bgra.chunks_exact_mut(4) {
                    px.swap(0, 2);
                }
                stdin.write_all(&bgra)?;
            }
        }
        self.frames += 1;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), EncoderError> {
        if !self.audio_active {
            // Video-only: the frame queue upstream is gated, nothing to do.
            debug!("ffmpeg pause (video only)");
            return Ok(());
        }
        #[cfg(unix)]
        {
            self.signal_child(libc::SIGSTOP)?;
            self.suspended = true;
            debug!("suspended ffmpeg to pause microphone capture");
            Ok(())
        }
        #[cfg(not(unix))]
        {
            Err(EncoderError::Unsupported(
                "pausing an audio recording is not supported on this platform".to_string(),
            ))
        }
    }

    fn resume(&mut self) -> Result<(), EncoderError> {
        if !self.audio_active {
            debug!("ffmpeg resume (video only)");
            return Ok(());
        }
        #[cfg(unix)]
        {
            self.signal_child(libc::SIGCONT)?;
            self.suspended = false;
            debug!("resumed suspended ffmpeg");
            Ok(())
        }
        #[cfg(not(unix))]
        {
            Err(EncoderError::Unsupported(
                "pausing an audio recording is not supported on this platform".to_string(),
            ))
        }
    }

    fn finish(mut self: Box<Self>) -> Result<EncodeStats, EncoderError> {
        // A suspended child never reaches EOF handling, wake it first.
        self.resume_if_suspended();
        drop(self.stdin.take());

        let mut child = self
            .child
            .take()
            .ok_or_else(|| EncoderError::Finalize("ffmpeg was never started".to_string()))?;
        let status = child.wait()?;
        if !status.success() {
            return Err(EncoderError::Finalize(format!(
                "ffmpeg exited with {status}"
            )));
        }

        let bytes = std::fs::metadata(&self.settings.output)?.len();
        if bytes == 0 {
            return Err(EncoderError::Finalize(
                "ffmpeg produced an empty file".to_string(),
            ));
        }
        let duration = Duration::from_micros(
            self.frames * 1_000_000 / u64::from(self.settings.fps.max(1)),
        );
        debug!(frames = self.frames, bytes, "ffmpeg finalized mp4");
        Ok(EncodeStats {
            frames: self.frames,
            dropped: 0,
            bytes,
            duration,
        })
    }

    fn abort(mut self: Box<Self>) {
        self.resume_if_suspended();
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Err(e) = std::fs::remove_file(&self.settings.output) {
            debug!("could not remove partial recording: {e}");
        }
    }
}
