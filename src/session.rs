//! Recording session metadata
//!
//! A session is opened by consuming a consent token and pins the identity of
//! one recording. When the recording completes, a small JSON sidecar next to
//! the output file records what was captured.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::capture::SourceKind;
use crate::consent::ConsentToken;
use crate::encoder::EncodeStats;
use crate::params::CaptureParams;

pub struct RecordingSession {
    session_id: Uuid,
    source: SourceKind,
    output: PathBuf,
    params: CaptureParams,
    started_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct SessionSidecar {
    session_id: String,
    source: String,
    output: String,
    width: u32,
    height: u32,
    fps: u32,
    encoder: String,
    frames: u64,
    dropped_frames: u64,
    bytes: u64,
    duration_ms: u64,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

impl RecordingSession {
    /// Consume a consent token and open a session writing to `output`.
    pub fn begin(token: ConsentToken, params: CaptureParams, output: PathBuf) -> Self {
        Self {
            session_id: token.session_id(),
            source: token.source(),
            output,
            params,
            started_at: token.granted_at(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// `<output>.json`, right next to the recording.
    pub fn sidecar_path(&self) -> PathBuf {
        let mut path = self.output.clone().into_os_string();
        path.push(".json");
        PathBuf::from(path)
    }

    pub fn write_sidecar(&self, stats: &EncodeStats, encoder: &str) -> Result<()> {
        let (width, height) = self.params.encoded_dimensions();
        let sidecar = SessionSidecar {
            session_id: self.session_id.to_string(),
            source: self.source.to_string(),
            output: self.output.display().to_string(),
            width,
            height,
            fps: self.params.fps,
            encoder: encoder.to_string(),
            frames: stats.frames,
            dropped_frames: stats.dropped,
            bytes: stats.bytes,
            duration_ms: stats.duration.as_millis() as u64,
            started_at: self.started_at,
            ended_at: Utc::now(),
        };

        let path = self.sidecar_path();
        let json =
            serde_json::to_string_pretty(&sidecar).context("serializing session sidecar")?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing session sidecar to {}", path.display()))?;
        info!(path = %path.display(), "wrote session sidecar");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> CaptureParams {
        CaptureParams::new(1280, 720, 30).unwrap()
    }

    #[test]
    fn sidecar_path_appends_json_to_the_output_name() {
        let token = ConsentToken::grant(SourceKind::Pattern);
        let session = RecordingSession::begin(token, params(), PathBuf::from("/tmp/clip.mp4"));
        assert_eq!(session.sidecar_path(), PathBuf::from("/tmp/clip.mp4.json"));
    }

    #[test]
    fn session_id_comes_from_the_consent_token() {
        let token = ConsentToken::grant(SourceKind::Pattern);
        let id = token.session_id();
        let session = RecordingSession::begin(token, params(), PathBuf::from("out.mp4"));
        assert_eq!(session.session_id(), id);
    }

    #[test]
    fn write_sidecar_records_the_run() {
        let output = std::env::temp_dir().join(format!(
            "screenrec-session-{}.mp4",
            uuid::Uuid::new_v4()
        ));
        let token = ConsentToken::grant(SourceKind::Pattern);
        let session = RecordingSession::begin(token, params(), output.clone());
        let stats = EncodeStats {
            frames: 90,
            dropped: 2,
            bytes: 1024,
            duration: Duration::from_secs(3),
        };
        session.write_sidecar(&stats, "software").unwrap();

        let raw = std::fs::read_to_string(session.sidecar_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["session_id"], session.session_id().to_string());
        assert_eq!(value["frames"], 90);
        assert_eq!(value["dropped_frames"], 2);
        assert_eq!(value["width"], 1280);
        assert_eq!(value["duration_ms"], 3000);
        assert_eq!(value["encoder"], "software");

        let _ = std::fs::remove_file(session.sidecar_path());
    }
}
