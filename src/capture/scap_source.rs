//! Display capture backend built on scap

use scap::capturer::{Capturer, Options, Resolution};
use scap::frame::FrameType;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use super::frame::{Frame, PixelFormat};
use super::source::{ScreenSource, SourceDescriptor, SourceError};

const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ScapSource {
    width: u32,
    height: u32,
    fps: u32,
    show_cursor: bool,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ScapSource {
    pub fn new(width: u32, height: u32, fps: u32, show_cursor: bool) -> Self {
        Self {
            width,
            height,
            fps,
            show_cursor,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl ScreenSource for ScapSource {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            name: "display",
            width: self.width,
            height: self.height,
        }
    }

    fn start(&mut self, tx: SyncSender<Frame>) -> Result<(), SourceError> {
        if self.handle.is_some() {
            return Err(SourceError::Start("display capture already started".to_string()));
        }
        if !scap::is_supported() {
            return Err(SourceError::Unavailable(
                "platform is not supported by the capture backend".to_string(),
            ));
        }
        if !scap::has_permission() {
            return Err(SourceError::Unavailable(
                "screen recording permission not granted".to_string(),
            ));
        }

        self.stop.store(false, Ordering::SeqCst);
        let stop = self.stop.clone();
        let (width, height, fps) = (self.width, self.height, self.fps);
        let show_cursor = self.show_cursor;
        // The capturer holds platform handles and stays on its own thread;
        // startup errors come back over this channel.
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), SourceError>>(1);

        let handle = std::thread::Builder::new()
            .name("scap-source".to_string())
            .spawn(move || {
                let options = Options {
                    fps,
                    target: None, // primary display
                    show_cursor,
                    show_highlight: false,
                    excluded_targets: None,
                    output_type: FrameType::BGRAFrame,
                    output_resolution: Resolution::Captured,
                    ..Default::default()
                };

                let mut capturer = match Capturer::build(options) {
                    Ok(capturer) => capturer,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SourceError::Start(format!(
                            "failed to create capturer: {e:?}"
                        ))));
                        return;
                    }
                };
                capturer.start_capture();

                // Capture dimensions are only known once the first frame arrives.
                let first = match wait_for_first_frame(&mut capturer) {
                    Ok(first) => first,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if (first.width, first.height) != (width, height) {
                    warn!(
                        "display delivers {}x{}, adapting to requested {}x{}",
                        first.width, first.height, width, height
                    );
                }
                let _ = ready_tx.send(Ok(()));

                let expected_len = Frame::expected_len(width, height);
                let mut last_good: Vec<u8> = fit_frame(&first, width, height);
                let mut empty_frames: u64 = 0;
                let mut bad_frames: u64 = 0;

                if send_frame(&tx, width, height, last_good.clone()).is_err() {
                    capturer.stop_capture();
                    return;
                }

                while !stop.load(Ordering::SeqCst) {
                    let raw = match capturer.get_next_frame() {
                        Ok(frame) => frame,
                        Err(_) => {
                            std::thread::sleep(Duration::from_millis(20));
                            continue;
                        }
                    };

                    let data = match normalize(raw) {
                        Some(captured) => {
                            if (captured.width, captured.height) == (width, height)
                                && captured.data.len() == expected_len
                            {
                                last_good = captured.data;
                            } else if captured.data.is_empty() {
                                // scap occasionally delivers empty frames; reuse the
                                // previous one to keep the cadence.
                                empty_frames += 1;
                            } else {
                                last_good = fit_frame(&captured, width, height);
                            }
                            last_good.clone()
                        }
                        None => {
                            bad_frames += 1;
                            continue;
                        }
                    };

                    if send_frame(&tx, width, height, data).is_err() {
                        break;
                    }
                }

                capturer.stop_capture();
                if empty_frames > 0 || bad_frames > 0 {
                    info!(
                        "display capture ended ({} empty frames reused, {} unusable frames skipped)",
                        empty_frames, bad_frames
                    );
                }
            })
            .map_err(|e| SourceError::Start(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.handle = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(SourceError::Start(
                    "capture thread exited during startup".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("display capture thread panicked");
            }
        }
    }
}

impl Drop for ScapSource {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CapturedFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

/// Flatten scap's frame variants into packed BGRA bytes.
fn normalize(frame: scap::frame::Frame) -> Option<CapturedFrame> {
    use scap::frame::Frame as F;

    let (width, height, data) = match frame {
        F::BGRA(f) => (f.width as u32, f.height as u32, f.data),
        F::BGR0(f) => (f.width as u32, f.height as u32, f.data),
        F::BGRx(f) => (f.width as u32, f.height as u32, f.data),
        F::RGBx(f) => (f.width as u32, f.height as u32, swizzle_rgba_to_bgra(f.data)),
        F::XBGR(f) => (f.width as u32, f.height as u32, rotate_xbgr_to_bgra(f.data)),
        F::RGB(f) => {
            let (w, h) = (f.width as u32, f.height as u32);
            (w, h, expand_rgb_to_bgra(&f.data))
        }
        _ => {
            debug!("unsupported frame variant from capture backend");
            return None;
        }
    };

    Some(CapturedFrame { width, height, data })
}

fn swizzle_rgba_to_bgra(mut data: Vec<u8>) -> Vec<u8> {
    for px in data.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
    data
}

fn rotate_xbgr_to_bgra(mut data: Vec<u8>) -> Vec<u8> {
    for px in data.chunks_exact_mut(4) {
        px.rotate_left(1);
    }
    data
}

fn expand_rgb_to_bgra(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 3 * 4);
    for px in data.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0], 255]);
    }
    out
}

/// Crop or zero-pad a captured frame to the requested dimensions, row by row.
fn fit_frame(frame: &CapturedFrame, width: u32, height: u32) -> Vec<u8> {
    let mut out = vec![0u8; Frame::expected_len(width, height)];
    let src_stride = frame.width as usize * 4;
    let dst_stride = width as usize * 4;
    let copy_len = src_stride.min(dst_stride);
    let rows = (frame.height.min(height)) as usize;

    for y in 0..rows {
        let src = y * src_stride;
        let dst = y * dst_stride;
        if src + copy_len <= frame.data.len() {
            out[dst..dst + copy_len].copy_from_slice(&frame.data[src..src + copy_len]);
        }
    }
    out
}

fn wait_for_first_frame(capturer: &mut Capturer) -> Result<CapturedFrame, SourceError> {
    let start = Instant::now();
    let mut attempts = 0u32;

    while start.elapsed() < FIRST_FRAME_TIMEOUT {
        attempts += 1;
        match capturer.get_next_frame() {
            Ok(frame) => {
                if let Some(captured) = normalize(frame) {
                    if !captured.data.is_empty() {
                        debug!(
                            "first frame after {} attempts: {}x{}",
                            attempts, captured.width, captured.height
                        );
                        return Ok(captured);
                    }
                }
            }
            Err(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }

    capturer.stop_capture();
    Err(SourceError::Start(format!(
        "no frame from display within {}s",
        FIRST_FRAME_TIMEOUT.as_secs()
    )))
}

fn send_frame(
    tx: &SyncSender<Frame>,
    width: u32,
    height: u32,
    data: Vec<u8>,
) -> Result<(), ()> {
    let frame = Frame {
        timestamp: SystemTime::now(),
        width,
        height,
        pixel_format: PixelFormat::Bgra8888,
        data,
    };
    match tx.try_send(frame) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Ok(()), // consumer busy, drop this frame
        Err(TrySendError::Disconnected(_)) => Err(()),
    }
}
