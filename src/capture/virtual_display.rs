//! Mirrored display plumbing
//!
//! A [`VirtualDisplay`] sits between a screen source and the encoder surface.
//! The source pushes frames into a small channel; a pump thread forwards them
//! to whatever surface is currently attached. Detaching the surface gates the
//! frame flow without touching the source, which is how pause works.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use super::source::{ScreenSource, SourceError};
use super::DisplayEvent;
use crate::encoder::{PushStatus, Surface, WorkerMsg};

/// Queue depth between the source and the pump.
const FRAME_QUEUE_DEPTH: usize = 4;

pub struct VirtualDisplay {
    source: Box<dyn ScreenSource>,
    surface: Arc<Mutex<Option<Surface>>>,
    events: SyncSender<WorkerMsg>,
    pump: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl VirtualDisplay {
    /// Start the source and begin pumping its frames into `surface`.
    ///
    /// `events` shares the encoder worker queue, so surface lifecycle
    /// notifications stay ordered with the frames around them.
    pub(crate) fn attach(
        mut source: Box<dyn ScreenSource>,
        surface: Surface,
        events: SyncSender<WorkerMsg>,
    ) -> Result<Self, SourceError> {
        let (frame_tx, frame_rx) = sync_channel(FRAME_QUEUE_DEPTH);
        source.start(frame_tx)?;

        let slot = Arc::new(Mutex::new(Some(surface)));
        let stop = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        let pump = {
            let slot = slot.clone();
            let stop = stop.clone();
            let delivered = delivered.clone();
            let dropped = dropped.clone();
            std::thread::Builder::new()
                .name("display-pump".to_string())
                .spawn(move || {
                    while let Ok(frame) = frame_rx.recv() {
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
                        let Some(surface) = guard.as_ref() else {
                            // Detached: pause discards frames on the floor.
                            continue;
                        };
                        match surface.push_frame(frame) {
                            PushStatus::Queued => {
                                delivered.fetch_add(1, Ordering::Relaxed);
                            }
                            PushStatus::QueueFull => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                            PushStatus::Disconnected => {
                                debug!("encoder queue gone, pump exiting");
                                break;
                            }
                        }
                    }
                })
                .map_err(|e| SourceError::Start(format!("display pump: {e}")))?
        };

        let descriptor = source.descriptor();
        info!(source = descriptor.name, "virtual display attached");
        Ok(Self {
            source,
            surface: slot,
            events,
            pump: Some(pump),
            stop,
            delivered,
            dropped,
        })
    }

    /// Swap the attached surface. `None` gates frames, `Some` restores flow.
    /// The matching lifecycle event is queued behind any in-flight frames.
    pub(crate) fn set_surface(&self, surface: Option<Surface>) {
        let had = {
            let mut guard = self.surface.lock().unwrap_or_else(|e| e.into_inner());
            let had = guard.is_some();
            *guard = surface;
            had
        };
        let has = self.has_surface();
        match (had, has) {
            (true, false) => self.send_event(DisplayEvent::Paused),
            (false, true) => self.send_event(DisplayEvent::Resumed),
            _ => {}
        }
    }

    pub fn has_surface(&self) -> bool {
        self.surface
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn send_event(&self, event: DisplayEvent) {
        debug!(?event, "surface changed");
        if self.events.try_send(WorkerMsg::Display(event)).is_err() {
            debug!(?event, "encoder queue not accepting display events");
        }
    }

    /// Stop the source, drain the pump, and report dropped frames.
    pub fn release(mut self) -> u64 {
        self.stop.store(true, Ordering::Relaxed);
        self.source.stop();
        {
            // Clear the slot directly, stopping is not a pause.
            let mut guard = self.surface.lock().unwrap_or_else(|e| e.into_inner());
            *guard = None;
        }
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                warn!("display pump panicked");
            }
        }
        let _ = self.events.try_send(WorkerMsg::Display(DisplayEvent::Stopped));
        let delivered = self.delivered.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        info!(delivered, dropped, "virtual display released");
        dropped
    }
}

impl Drop for VirtualDisplay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.source.stop();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::SourceDescriptor;
    use crate::capture::{Frame, PixelFormat};
    use crate::encoder::test_queue;
    use std::sync::mpsc::Receiver;
    use std::time::{Duration, SystemTime};

    struct TickSource {
        stop: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl TickSource {
        fn new() -> Self {
            Self {
                stop: Arc::new(AtomicBool::new(false)),
                handle: None,
            }
        }
    }

    impl ScreenSource for TickSource {
        fn descriptor(&self) -> SourceDescriptor {
            SourceDescriptor {
                name: "tick",
                width: 8,
                height: 8,
            }
        }

        fn start(&mut self, tx: std::sync::mpsc::SyncSender<Frame>) -> Result<(), SourceError> {
            let stop = self.stop.clone();
            self.handle = Some(std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let frame = Frame {
                        timestamp: SystemTime::now(),
                        width: 8,
                        height: 8,
                        pixel_format: PixelFormat::Bgra8888,
                        data: vec![0; 8 * 8 * 4],
                    };
                    match tx.try_send(frame) {
                        Ok(()) | Err(std::sync::mpsc::TrySendError::Full(_)) => {}
                        Err(std::sync::mpsc::TrySendError::Disconnected(_)) => break,
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            }));
            Ok(())
        }

        fn stop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    enum Seen {
        Frame,
        Event(DisplayEvent),
    }

    fn drain(rx: &Receiver<WorkerMsg>) -> Vec<Seen> {
        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                WorkerMsg::Frame(_) => seen.push(Seen::Frame),
                WorkerMsg::Display(ev) => seen.push(Seen::Event(ev)),
                _ => {}
            }
        }
        seen
    }

    #[test]
    fn frames_flow_only_while_a_surface_is_attached() {
        let (surface, tx, rx) = test_queue(256);
        let display =
            VirtualDisplay::attach(Box::new(TickSource::new()), surface, tx.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(40));
        let before = drain(&rx);
        assert!(before.iter().any(|s| matches!(s, Seen::Frame)));

        display.set_surface(None);
        assert!(!display.has_surface());
        // Everything already queued, then the pause marker, then silence.
        let mut tail = drain(&rx);
        std::thread::sleep(Duration::from_millis(40));
        tail.extend(drain(&rx));
        let paused_at = tail
            .iter()
            .position(|s| matches!(s, Seen::Event(DisplayEvent::Paused)))
            .unwrap();
        assert!(
            !tail[paused_at..].iter().any(|s| matches!(s, Seen::Frame)),
            "no frames may pass a detached surface"
        );

        display.set_surface(Some(crate::encoder::surface_for_tests(tx.clone())));
        std::thread::sleep(Duration::from_millis(40));
        let resumed = drain(&rx);
        assert!(resumed
            .iter()
            .any(|s| matches!(s, Seen::Event(DisplayEvent::Resumed))));
        assert!(resumed.iter().any(|s| matches!(s, Seen::Frame)));

        display.release();
        let after = drain(&rx);
        assert!(after
            .iter()
            .any(|s| matches!(s, Seen::Event(DisplayEvent::Stopped))));
    }

    #[test]
    fn release_stops_the_source_and_reports_drops() {
        let (surface, tx, rx) = test_queue(256);
        let display = VirtualDisplay::attach(Box::new(TickSource::new()), surface, tx).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let dropped = display.release();
        assert_eq!(dropped, 0);
        let seen = drain(&rx);
        assert!(seen.iter().any(|s| matches!(s, Seen::Frame)));
        assert!(seen
            .iter()
            .any(|s| matches!(s, Seen::Event(DisplayEvent::Stopped))));
    }
}
