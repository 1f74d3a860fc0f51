//! Session keeper
//!
//! Keeps a user-visible marker alive for as long as a session is recording
//! or paused. On platforms with a desktop notification daemon that marker is
//! a persistent notification; elsewhere it degrades to log lines. Posting
//! and clearing are idempotent, repeated state reports do nothing.

use anyhow::Result;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Something that can show and remove the "recording" marker.
pub trait Notify: Send {
    fn post(&mut self, body: &str) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
}

/// Cheap clonable handle for reporting recording state to the keeper.
#[derive(Clone)]
pub struct KeeperHandle {
    tx: mpsc::UnboundedSender<bool>,
}

impl KeeperHandle {
    pub fn set_recording(&self, active: bool) {
        if self.tx.send(active).is_err() {
            warn!("Session keeper is gone, dropping state update");
        }
    }
}

pub struct SessionKeeper {
    rx: mpsc::UnboundedReceiver<bool>,
    notifier: Box<dyn Notify>,
    posted: bool,
    body: String,
}

impl SessionKeeper {
    pub fn new(notifier: Box<dyn Notify>, output: &Path) -> (Self, KeeperHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let keeper = Self {
            rx,
            notifier,
            posted: false,
            body: format!("Recording to {}", output.display()),
        };
        (keeper, KeeperHandle { tx })
    }

    /// Run the keeper on the runtime and return its handle.
    pub fn spawn(notifier: Box<dyn Notify>, output: &Path) -> KeeperHandle {
        let (keeper, handle) = Self::new(notifier, output);
        tokio::spawn(keeper.run());
        handle
    }

    async fn run(mut self) {
        while let Some(active) = self.rx.recv().await {
            self.apply(active);
        }
        // Every handle is gone. Never leave a stale marker behind.
        if self.posted {
            self.apply(false);
        }
        debug!("session keeper exited");
    }

    fn apply(&mut self, active: bool) {
        if active == self.posted {
            debug!(active, "keeper state unchanged");
            return;
        }
        if active {
            match self.notifier.post(&self.body) {
                Ok(()) => {
                    self.posted = true;
                    info!("Posted recording notification");
                }
                Err(e) => warn!("Could not post recording notification: {e:#}"),
            }
        } else {
            match self.notifier.clear() {
                Ok(()) => info!("Cleared recording notification"),
                Err(e) => warn!("Could not clear recording notification: {e:#}"),
            }
            self.posted = false;
        }
    }
}

/// Pick the best notifier for this platform.
pub fn create_notifier(enabled: bool) -> Box<dyn Notify> {
    if !enabled {
        info!("Desktop notifications disabled, logging session state only");
        return Box::new(LogNotifier);
    }
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    {
        Box::new(DesktopNotifier::new())
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        info!("No desktop notifier on this platform, logging session state only");
        Box::new(LogNotifier)
    }
}

/// Fallback marker: log lines instead of a notification.
struct LogNotifier;

impl Notify for LogNotifier {
    fn post(&mut self, body: &str) -> Result<()> {
        info!("RECORDING ACTIVE: {body}");
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        info!("Recording session ended");
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
struct DesktopNotifier {
    #[cfg(target_os = "linux")]
    handle: Option<notify_rust::NotificationHandle>,
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
impl DesktopNotifier {
    fn new() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            handle: None,
        }
    }
}

#[cfg(target_os = "linux")]
impl Notify for DesktopNotifier {
    fn post(&mut self, body: &str) -> Result<()> {
        let handle = notify_rust::Notification::new()
            .appname("screenrec")
            .summary("Recording screen")
            .body(body)
            .timeout(notify_rust::Timeout::Never)
            .show()?;
        self.handle = Some(handle);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
        Ok(())
    }
}

#[cfg(target_os = "windows")]
impl Notify for DesktopNotifier {
    fn post(&mut self, body: &str) -> Result<()> {
        notify_rust::Notification::new()
            .appname("screenrec")
            .summary("Recording screen")
            .body(body)
            .show()?;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        // Toasts cannot be dismissed programmatically, announce the stop.
        notify_rust::Notification::new()
            .appname("screenrec")
            .summary("Recording stopped")
            .show()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counts {
        posted: usize,
        cleared: usize,
    }

    struct MockNotifier(Arc<Mutex<Counts>>);

    impl Notify for MockNotifier {
        fn post(&mut self, _body: &str) -> Result<()> {
            self.0.lock().unwrap().posted += 1;
            Ok(())
        }

        fn clear(&mut self) -> Result<()> {
            self.0.lock().unwrap().cleared += 1;
            Ok(())
        }
    }

    #[test]
    fn repeated_state_reports_post_and_clear_once() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let (mut keeper, _handle) = SessionKeeper::new(
            Box::new(MockNotifier(counts.clone())),
            Path::new("/tmp/out.mp4"),
        );

        keeper.apply(true);
        keeper.apply(true);
        keeper.apply(false);
        keeper.apply(false);
        keeper.apply(true);

        let counts = counts.lock().unwrap();
        assert_eq!(counts.posted, 2);
        assert_eq!(counts.cleared, 1);
    }

    #[tokio::test]
    async fn leftover_notification_is_cleared_on_shutdown() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let (keeper, handle) = SessionKeeper::new(
            Box::new(MockNotifier(counts.clone())),
            Path::new("/tmp/out.mp4"),
        );
        let task = tokio::spawn(keeper.run());

        handle.set_recording(true);
        drop(handle);
        task.await.unwrap();

        let counts = counts.lock().unwrap();
        assert_eq!(counts.posted, 1);
        assert_eq!(counts.cleared, 1);
    }

    #[test]
    fn body_names_the_output_file() {
        let counts = Arc::new(Mutex::new(Counts::default()));
        let (keeper, _handle) = SessionKeeper::new(
            Box::new(MockNotifier(counts)),
            Path::new("/videos/demo.mp4"),
        );
        assert!(keeper.body.contains("demo.mp4"));
    }
}
