//! Screen capture: frame sources, the mirrored display, and the pipeline
//! that ties them to an encoder.

mod frame;
mod pattern_source;
mod pipeline;
#[cfg(feature = "scap")]
mod scap_source;
mod source;
mod virtual_display;

pub use frame::{Frame, PixelFormat};
pub use pipeline::{CapturePipeline, PipelineError, PipelineOptions, PipelineState};
pub use source::{
    create_screen_source, display_bounds, ScreenSource, SourceDescriptor, SourceError, SourceKind,
};
pub use virtual_display::VirtualDisplay;

/// Surface lifecycle notifications, queued behind the frames they delimit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    Paused,
    Resumed,
    Stopped,
}
