//! Recording control - command loop, status broadcast, and the session keeper

mod controller;
pub mod keeper;

pub use controller::{create_control_channels, ControllerSettings, RecordController};
pub use keeper::{create_notifier, SessionKeeper};

/// Commands that can be sent to the record controller
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Begin a new recording (asks for capture consent first)
    Start,
    /// Gate the frame flow without ending the session
    Pause,
    /// Lift the pause gate
    Resume,
    /// Finish the recording and finalize the output file
    Stop,
    /// Stop any recording and exit the control loop
    Shutdown,
}

/// Status updates from the record controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlStatus {
    /// Nothing is recording
    Idle,
    /// Waiting on the capture consent prompt
    AwaitingConsent,
    /// Recording is live
    Recording {
        /// Session identifier of the active recording
        session_id: String,
    },
    /// Recording is paused
    Paused {
        /// Session identifier of the paused recording
        session_id: String,
    },
    /// An error occurred
    Error(String),
}
