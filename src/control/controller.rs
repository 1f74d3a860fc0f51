//! Record controller
//!
//! Owns the recording lifecycle: consent, pipeline construction, pause and
//! resume, teardown. Driven by commands from the UI loop, reporting state
//! over a broadcast channel. Heavy pipeline work happens via
//! `block_in_place` so the control loop never stalls the runtime.

use anyhow::Result;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::keeper::KeeperHandle;
use super::{ControlCommand, ControlStatus};
use crate::capture::{CapturePipeline, PipelineOptions, PipelineState, SourceKind};
use crate::consent::{self, ConsentError, ConsentToken};
use crate::encoder::EncoderKind;
use crate::params::CaptureParams;

/// Resolved recording configuration the controller starts sessions with.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub params: CaptureParams,
    pub source: SourceKind,
    pub encoder: EncoderKind,
    pub audio: bool,
    pub output: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    pub show_cursor: bool,
}

impl ControllerSettings {
    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            params: self.params,
            source: self.source,
            encoder: self.encoder,
            audio: self.audio,
            output: self.output.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
            show_cursor: self.show_cursor,
        }
    }
}

pub struct RecordController {
    settings: ControllerSettings,
    keeper: KeeperHandle,
    cmd_rx: mpsc::Receiver<ControlCommand>,
    status_tx: broadcast::Sender<ControlStatus>,
    pipeline: Option<CapturePipeline>,
    consent_rx: Option<mpsc::Receiver<Result<ConsentToken, ConsentError>>>,
}

impl RecordController {
    pub fn new(
        settings: ControllerSettings,
        keeper: KeeperHandle,
        cmd_rx: mpsc::Receiver<ControlCommand>,
        status_tx: broadcast::Sender<ControlStatus>,
    ) -> Self {
        Self {
            settings,
            keeper,
            cmd_rx,
            status_tx,
            pipeline: None,
            consent_rx: None,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            output = %self.settings.output.display(),
            params = %self.settings.params,
            "Record controller starting"
        );
        self.broadcast(ControlStatus::Idle);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("Command channel closed, shutting down");
                        self.handle_stop();
                        break;
                    };
                    debug!(?cmd, "control command");
                    match cmd {
                        ControlCommand::Start => self.handle_start(),
                        ControlCommand::Pause => self.handle_pause(),
                        ControlCommand::Resume => self.handle_resume(),
                        ControlCommand::Stop => self.handle_stop(),
                        ControlCommand::Shutdown => {
                            info!("Shutdown command received");
                            self.handle_stop();
                            break;
                        }
                    }
                }

                // Arm is live only while a consent request is in flight.
                result = async {
                    match self.consent_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.consent_rx = None;
                    self.on_consent(result);
                }
            }
        }

        info!("Record controller stopped");
        Ok(())
    }

    fn broadcast(&self, status: ControlStatus) {
        // Send fails only when nobody is listening, which is fine.
        let _ = self.status_tx.send(status);
    }

    /// Enter recording state and kick off the async consent request. The
    /// pipeline is built later, when the grant arrives.
    fn handle_start(&mut self) {
        if self.pipeline.is_some() || self.consent_rx.is_some() {
            warn!("Recording already in progress");
            self.broadcast(ControlStatus::Error(
                "recording already in progress".to_string(),
            ));
            return;
        }

        self.keeper.set_recording(true);
        self.broadcast(ControlStatus::AwaitingConsent);

        let source = self.settings.source;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let result = consent::request_consent(source).await;
            let _ = tx.send(result).await;
        });
        self.consent_rx = Some(rx);
    }

    fn on_consent(&mut self, result: Option<Result<ConsentToken, ConsentError>>) {
        match result {
            Some(Ok(token)) => {
                info!(session = %token.session_id(), "Capture consent granted");
                let options = self.settings.pipeline_options();
                match tokio::task::block_in_place(|| CapturePipeline::build(token, &options)) {
                    Ok(pipeline) => {
                        self.broadcast(ControlStatus::Recording {
                            session_id: pipeline.session_id().to_string(),
                        });
                        self.pipeline = Some(pipeline);
                    }
                    Err(e) => {
                        error!("Failed to start recording: {e}");
                        self.keeper.set_recording(false);
                        self.broadcast(ControlStatus::Error(format!(
                            "failed to start recording: {e}"
                        )));
                        self.broadcast(ControlStatus::Idle);
                    }
                }
            }
            Some(Err(e)) => {
                warn!("Capture consent not granted: {e}");
                self.keeper.set_recording(false);
                self.broadcast(ControlStatus::Error(e.to_string()));
                self.broadcast(ControlStatus::Idle);
            }
            None => {
                warn!("Consent task ended without an answer");
                self.keeper.set_recording(false);
                self.broadcast(ControlStatus::Error("consent request failed".to_string()));
                self.broadcast(ControlStatus::Idle);
            }
        }
    }

    fn handle_pause(&mut self) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            warn!("Pause requested but no recording is active");
            self.broadcast(ControlStatus::Error("no recording to pause".to_string()));
            return;
        };
        if pipeline.state() == PipelineState::Paused {
            warn!("Recording is already paused");
            return;
        }
        // The send into the worker queue can block while the worker is busy.
        match tokio::task::block_in_place(|| pipeline.pause()) {
            Ok(()) => {
                let session_id = pipeline.session_id().to_string();
                self.broadcast(ControlStatus::Paused { session_id });
            }
            Err(e) => {
                error!("Pause failed: {e}");
                self.broadcast(ControlStatus::Error(format!("pause failed: {e}")));
            }
        }
    }

    fn handle_resume(&mut self) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            warn!("Resume requested but no recording is active");
            self.broadcast(ControlStatus::Error("no recording to resume".to_string()));
            return;
        };
        if pipeline.state() == PipelineState::Recording {
            warn!("Recording is not paused");
            return;
        }
        match tokio::task::block_in_place(|| pipeline.resume()) {
            Ok(()) => {
                let session_id = pipeline.session_id().to_string();
                self.broadcast(ControlStatus::Recording { session_id });
            }
            Err(e) => {
                error!("Resume failed: {e}");
                self.broadcast(ControlStatus::Error(format!("resume failed: {e}")));
            }
        }
    }

    /// Stop whatever is in flight: cancel a pending consent prompt, or tear
    /// down the live pipeline. Stopping while idle is a quiet no-op.
    fn handle_stop(&mut self) {
        if self.consent_rx.take().is_some() {
            info!("Cancelling pending consent request");
            self.keeper.set_recording(false);
            self.broadcast(ControlStatus::Idle);
            return;
        }

        let Some(pipeline) = self.pipeline.take() else {
            debug!("No recording in progress");
            return;
        };

        self.keeper.set_recording(false);
        match tokio::task::block_in_place(|| pipeline.shutdown()) {
            Ok(stats) => {
                info!(
                    frames = stats.frames,
                    dropped = stats.dropped,
                    bytes = stats.bytes,
                    duration_ms = stats.duration.as_millis() as u64,
                    "Recording stopped"
                );
            }
            Err(e) => {
                error!("Failed to stop recording cleanly: {e}");
                self.broadcast(ControlStatus::Error(format!("stop failed: {e}")));
            }
        }
        self.broadcast(ControlStatus::Idle);
    }
}

pub fn create_control_channels() -> (
    mpsc::Sender<ControlCommand>,
    mpsc::Receiver<ControlCommand>,
    broadcast::Sender<ControlStatus>,
    broadcast::Receiver<ControlStatus>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = broadcast::channel(16);
    (cmd_tx, cmd_rx, status_tx, status_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::keeper::{Notify, SessionKeeper};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct FlagNotifier {
        posted: Arc<AtomicBool>,
    }

    impl Notify for FlagNotifier {
        fn post(&mut self, _body: &str) -> Result<()> {
            self.posted.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn clear(&mut self) -> Result<()> {
            self.posted.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn temp_output(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "screenrec-controller-{tag}-{}.mp4",
            uuid::Uuid::new_v4()
        ))
    }

    fn settings(output: PathBuf) -> ControllerSettings {
        ControllerSettings {
            params: CaptureParams::new(1280, 720, 30).unwrap(),
            source: SourceKind::Pattern,
            encoder: EncoderKind::Software,
            audio: false,
            output,
            ffmpeg_path: None,
            show_cursor: false,
        }
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<ControlStatus>,
        want: fn(&ControlStatus) -> bool,
    ) -> ControlStatus {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(status)) if want(&status) => return status,
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(_)) | Err(_) => panic!("status stream ended before the expected state"),
            }
        }
    }

    async fn wait_until_cleared(posted: &Arc<AtomicBool>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while posted.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_lifecycle_records_a_playable_file() {
        let output = temp_output("lifecycle");
        let posted = Arc::new(AtomicBool::new(false));
        let keeper = SessionKeeper::spawn(
            Box::new(FlagNotifier {
                posted: posted.clone(),
            }),
            &output,
        );
        let (cmd_tx, cmd_rx, status_tx, mut status_rx) = create_control_channels();
        let mut controller = RecordController::new(settings(output.clone()), keeper, cmd_rx, status_tx);
        let task = tokio::spawn(async move { controller.run().await });

        cmd_tx.send(ControlCommand::Start).await.unwrap();
        wait_for(&mut status_rx, |s| matches!(s, ControlStatus::AwaitingConsent)).await;
        wait_for(&mut status_rx, |s| {
            matches!(s, ControlStatus::Recording { .. })
        })
        .await;
        assert!(posted.load(Ordering::SeqCst), "keeper marks the session");
        tokio::time::sleep(Duration::from_millis(300)).await;

        cmd_tx.send(ControlCommand::Pause).await.unwrap();
        wait_for(&mut status_rx, |s| matches!(s, ControlStatus::Paused { .. })).await;
        assert!(
            posted.load(Ordering::SeqCst),
            "marker stays up while paused"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        cmd_tx.send(ControlCommand::Resume).await.unwrap();
        wait_for(&mut status_rx, |s| {
            matches!(s, ControlStatus::Recording { .. })
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        cmd_tx.send(ControlCommand::Stop).await.unwrap();
        wait_for(&mut status_rx, |s| matches!(s, ControlStatus::Idle)).await;
        wait_until_cleared(&posted).await;
        assert!(!posted.load(Ordering::SeqCst), "marker cleared after stop");

        cmd_tx.send(ControlCommand::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();

        let file = std::fs::File::open(&output).unwrap();
        let size = file.metadata().unwrap().len();
        let reader = mp4::Mp4Reader::read_header(std::io::BufReader::new(file), size).unwrap();
        let track = reader.tracks().values().next().unwrap();
        assert_eq!(track.width(), 1280);
        assert_eq!(track.height(), 720);
        assert!(reader.duration() > Duration::ZERO);

        let sidecar = PathBuf::from(format!("{}.json", output.display()));
        assert!(sidecar.exists());

        let _ = std::fs::remove_file(&output);
        let _ = std::fs::remove_file(&sidecar);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_is_rejected_while_recording() {
        let output = temp_output("double-start");
        let posted = Arc::new(AtomicBool::new(false));
        let keeper = SessionKeeper::spawn(
            Box::new(FlagNotifier {
                posted: posted.clone(),
            }),
            &output,
        );
        let (cmd_tx, cmd_rx, status_tx, mut status_rx) = create_control_channels();
        let mut controller = RecordController::new(settings(output.clone()), keeper, cmd_rx, status_tx);
        let task = tokio::spawn(async move { controller.run().await });

        cmd_tx.send(ControlCommand::Start).await.unwrap();
        wait_for(&mut status_rx, |s| {
            matches!(s, ControlStatus::Recording { .. })
        })
        .await;

        cmd_tx.send(ControlCommand::Start).await.unwrap();
        let status = wait_for(&mut status_rx, |s| matches!(s, ControlStatus::Error(_))).await;
        if let ControlStatus::Error(message) = status {
            assert!(message.contains("already in progress"));
        }

        cmd_tx.send(ControlCommand::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();

        let _ = std::fs::remove_file(format!("{}.json", output.display()));
        let _ = std::fs::remove_file(&output);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_and_pause_while_idle_do_not_crash() {
        let output = temp_output("idle-ops");
        let posted = Arc::new(AtomicBool::new(false));
        let keeper = SessionKeeper::spawn(
            Box::new(FlagNotifier {
                posted: posted.clone(),
            }),
            &output,
        );
        let (cmd_tx, cmd_rx, status_tx, mut status_rx) = create_control_channels();
        let mut controller = RecordController::new(settings(output.clone()), keeper, cmd_rx, status_tx);
        let task = tokio::spawn(async move { controller.run().await });

        cmd_tx.send(ControlCommand::Stop).await.unwrap();
        cmd_tx.send(ControlCommand::Stop).await.unwrap();
        cmd_tx.send(ControlCommand::Pause).await.unwrap();
        let status = wait_for(&mut status_rx, |s| matches!(s, ControlStatus::Error(_))).await;
        if let ControlStatus::Error(message) = status {
            assert!(message.contains("no recording"));
        }

        cmd_tx.send(ControlCommand::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(!posted.load(Ordering::SeqCst));
    }

    #[cfg(not(feature = "scap"))]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unavailable_display_source_restores_idle() {
        let output = temp_output("no-backend");
        let posted = Arc::new(AtomicBool::new(false));
        let keeper = SessionKeeper::spawn(
            Box::new(FlagNotifier {
                posted: posted.clone(),
            }),
            &output,
        );
        let (cmd_tx, cmd_rx, status_tx, mut status_rx) = create_control_channels();
        let mut bad = settings(output.clone());
        bad.source = SourceKind::Display;
        let mut controller = RecordController::new(bad, keeper, cmd_rx, status_tx);
        let task = tokio::spawn(async move { controller.run().await });

        cmd_tx.send(ControlCommand::Start).await.unwrap();
        wait_for(&mut status_rx, |s| matches!(s, ControlStatus::Error(_))).await;
        wait_for(&mut status_rx, |s| matches!(s, ControlStatus::Idle)).await;
        wait_until_cleared(&posted).await;
        assert!(!posted.load(Ordering::SeqCst), "keeper rolled back");

        cmd_tx.send(ControlCommand::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
    }
}
