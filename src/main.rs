//! screenrec
//!
//! Minimal screen recorder: captures a screen source and the microphone
//! into an MPEG-4 file, with start/pause/resume/stop control from the
//! terminal.

mod capture;
mod cli;
mod config;
mod consent;
mod control;
mod encoder;
mod logging;
mod params;
mod session;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use cli::Cli;
use config::Config;
use control::{
    create_control_channels, create_notifier, ControlCommand, ControlStatus, ControllerSettings,
    RecordController, SessionKeeper,
};
use encoder::EncoderKind;
use params::{CaptureParams, FALLBACK_BOUNDS};

/// Main entry point. The controller runs on a dedicated thread; the main
/// thread reads commands from the terminal.
fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::init_logging(cli.verbose)?;
    info!("screenrec starting...");
    if let Ok(dir) = logging::get_log_dir() {
        debug!("Logging to {:?}", dir);
    }

    // Load configuration
    let config = Config::load_from(cli.config.as_deref())?;
    info!("Configuration loaded from {:?}", config.config_path());

    let settings = resolve_settings(&cli, &config)?;
    info!(
        "Recording {} ({} encoder, audio {}) to {:?}",
        settings.params,
        settings.encoder,
        if settings.audio { "on" } else { "off" },
        settings.output
    );

    // Preflight checks are advisory, starting a session reports the real error
    if !consent::supported(settings.source) {
        warn!(
            "Capture backend for source '{}' is not available on this system",
            settings.source
        );
    }
    if settings.encoder == EncoderKind::Ffmpeg
        && !encoder::ffmpeg::available(settings.ffmpeg_path.as_deref())
    {
        warn!("ffmpeg binary not found, recording will fail to start (try --encoder software)");
    }

    // Create tokio runtime for async operations
    let runtime = Arc::new(tokio::runtime::Runtime::new()?);

    // Create controller channels
    let (cmd_tx, cmd_rx, status_tx, status_rx) = create_control_channels();

    // The session keeper and status printer live on the runtime
    let keeper = {
        let _enter = runtime.enter();
        let keeper = SessionKeeper::spawn(
            create_notifier(config.notification.enabled && !cli.no_notify),
            &settings.output,
        );
        tokio::spawn(print_status_updates(status_rx));
        keeper
    };

    let mut controller = RecordController::new(settings, keeper, cmd_rx, status_tx);

    // Spawn the controller on the tokio runtime
    let controller_runtime = runtime.clone();
    let controller_handle = std::thread::spawn(move || {
        controller_runtime.block_on(async move {
            if let Err(e) = controller.run().await {
                error!("Controller error: {}", e);
            }
        });
    });

    // Set up Ctrl+C handler that sends the shutdown command
    let ctrl_c_tx = cmd_tx.clone();
    let ctrl_c_runtime = runtime.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let tx = ctrl_c_tx.clone();
        ctrl_c_runtime.spawn(async move {
            let _ = tx.send(ControlCommand::Shutdown).await;
        });
    })?;

    let autostart = cli.autostart || config.recording.autostart || cli.duration.is_some();

    if let Some(secs) = cli.duration {
        // Timed run: start, wait, shut down.
        info!("Recording for {} seconds", secs);
        runtime.block_on(async {
            let _ = cmd_tx.send(ControlCommand::Start).await;
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let _ = cmd_tx.send(ControlCommand::Shutdown).await;
        });
    } else {
        if autostart {
            cmd_tx.blocking_send(ControlCommand::Start)?;
        }
        // The prompt thread is not joined: it may sit in a blocked stdin
        // read after Ctrl+C, and process exit reaps it.
        let prompt_tx = cmd_tx.clone();
        std::thread::spawn(move || run_prompt(prompt_tx));
    }

    // Wait for the controller to finish (shutdown comes from the prompt,
    // the timer, or Ctrl+C)
    let _ = controller_handle.join();

    info!("Shutdown complete");
    Ok(())
}

/// Merge CLI flags over the config file, falling back to source bounds and
/// then the built-in defaults.
fn resolve_settings(cli: &Cli, config: &Config) -> Result<ControllerSettings> {
    let recording = &config.recording;
    let source = cli.source.unwrap_or(recording.source);
    let encoder = cli.encoder.unwrap_or(recording.encoder);

    let bounds = capture::display_bounds(source);
    let width = cli
        .width
        .or(recording.width)
        .or(bounds.map(|(w, _)| w))
        .unwrap_or(FALLBACK_BOUNDS.0);
    let height = cli
        .height
        .or(recording.height)
        .or(bounds.map(|(_, h)| h))
        .unwrap_or(FALLBACK_BOUNDS.1);
    let fps = cli.fps.unwrap_or(recording.fps);
    let params = CaptureParams::new(width, height, fps)?;

    let output = cli
        .output
        .clone()
        .or_else(|| recording.output.clone())
        .unwrap_or_else(config::default_output_path);

    Ok(ControllerSettings {
        params,
        source,
        encoder,
        audio: recording.enable_audio && !cli.no_audio,
        output,
        ffmpeg_path: recording.ffmpeg_path.clone(),
        show_cursor: recording.show_cursor,
    })
}

/// Mirror controller state transitions onto stdout.
async fn print_status_updates(mut status_rx: broadcast::Receiver<ControlStatus>) {
    loop {
        match status_rx.recv().await {
            Ok(ControlStatus::Idle) => println!("state: idle"),
            Ok(ControlStatus::AwaitingConsent) => println!("state: awaiting capture consent"),
            Ok(ControlStatus::Recording { session_id }) => {
                println!("state: recording ({session_id})");
            }
            Ok(ControlStatus::Paused { session_id }) => println!("state: paused ({session_id})"),
            Ok(ControlStatus::Error(message)) => println!("error: {message}"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Status printer lagged by {} updates", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Read commands from stdin until quit or EOF, then ask the controller to
/// shut down.
fn run_prompt(cmd_tx: mpsc::Sender<ControlCommand>) {
    println!("Commands: start, pause, resume, stop, quit");
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read from stdin: {}", e);
                break;
            }
        }
        let cmd = match line.trim() {
            "" => continue,
            "start" => ControlCommand::Start,
            "pause" => ControlCommand::Pause,
            "resume" => ControlCommand::Resume,
            "stop" => ControlCommand::Stop,
            "quit" | "exit" => break,
            other => {
                println!("unknown command '{other}' (start, pause, resume, stop, quit)");
                continue;
            }
        };
        if cmd_tx.blocking_send(cmd).is_err() {
            break;
        }
    }
    if cmd_tx.blocking_send(ControlCommand::Shutdown).is_err() {
        debug!("Controller already stopped at prompt exit");
    }
}
