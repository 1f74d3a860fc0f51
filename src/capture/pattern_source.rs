//! Synthetic test pattern source
//!
//! Generates moving color bars at a fixed size and frame rate. Used for
//! recording without capture permissions, for demos, and for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::frame::{Frame, PixelFormat};
use super::source::{ScreenSource, SourceDescriptor, SourceError};

/// Classic color bars, BGRA byte order.
const BAR_COLORS: [[u8; 4]; 8] = [
    [192, 192, 192, 255], // white
    [0, 192, 192, 255],   // yellow
    [192, 192, 0, 255],   // cyan
    [0, 192, 0, 255],     // green
    [192, 0, 192, 255],   // magenta
    [0, 0, 192, 255],     // red
    [192, 0, 0, 255],     // blue
    [16, 16, 16, 255],    // near-black
];

pub struct PatternSource {
    width: u32,
    height: u32,
    fps: u32,
    stop: Arc<AtomicBool>,
    frames_emitted: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl PatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            stop: Arc::new(AtomicBool::new(false)),
            frames_emitted: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }

}

impl ScreenSource for PatternSource {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            name: "pattern",
            width: self.width,
            height: self.height,
        }
    }

    fn start(&mut self, tx: SyncSender<Frame>) -> Result<(), SourceError> {
        if self.handle.is_some() {
            return Err(SourceError::Start(
                "pattern source already started".to_string(),
            ));
        }

        self.stop.store(false, Ordering::SeqCst);
        let stop = self.stop.clone();
        let frames_emitted = self.frames_emitted.clone();
        let (width, height, fps) = (self.width, self.height, self.fps);

        let handle = std::thread::Builder::new()
            .name("pattern-source".to_string())
            .spawn(move || {
                let interval = Duration::from_secs(1) / fps.max(1);
                let mut tick: u64 = 0;

                while !stop.load(Ordering::SeqCst) {
                    let frame = Frame {
                        timestamp: SystemTime::now(),
                        width,
                        height,
                        pixel_format: PixelFormat::Bgra8888,
                        data: render_bars(width, height, tick),
                    };

                    match tx.try_send(frame) {
                        Ok(()) => {
                            frames_emitted.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Full(_)) => {
                            debug!("pattern frame dropped: channel full");
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }

                    tick = tick.wrapping_add(1);
                    std::thread::sleep(interval);
                }

                debug!("pattern source thread exiting after {} ticks", tick);
            })
            .map_err(|e| SourceError::Start(format!("failed to spawn pattern thread: {e}")))?;

        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("pattern source thread panicked");
            }
            debug!(
                "pattern source stopped after {} frames",
                self.frames_emitted.load(Ordering::Relaxed)
            );
        }
    }
}

impl Drop for PatternSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Render one frame of bars; `tick` shifts the bars sideways so consecutive
/// frames differ.
fn render_bars(width: u32, height: u32, tick: u64) -> Vec<u8> {
    let mut row = Vec::with_capacity(width as usize * 4);
    let bar_width = (width / BAR_COLORS.len() as u32).max(1);
    let offset = (tick as u32).wrapping_mul(4);

    for x in 0..width {
        let bar = ((x.wrapping_add(offset)) / bar_width) as usize % BAR_COLORS.len();
        row.extend_from_slice(&BAR_COLORS[bar]);
    }

    let mut data = Vec::with_capacity(Frame::expected_len(width, height));
    for _ in 0..height {
        data.extend_from_slice(&row);
    }
    data
}
