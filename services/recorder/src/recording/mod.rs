//! Triggered recording: pre-event cache, session state machine and clip output.

mod cache;
mod controller;
#[cfg(feature = "gstreamer")]
mod gst_sink;
mod session;
mod sink;

pub use cache::PreEventCache;
pub use controller::{
    ControllerSettings, ControllerStats, ControllerStatus, RecordingController, RequestId,
    SessionError, StartRequester,
};
#[cfg(feature = "gstreamer")]
pub use gst_sink::GstClipSink;
pub use session::{
    clip_file_name, RecordingSession, SessionCompleted, SessionId, SessionState, StartRequest,
    StopStatus,
};
pub use sink::{
    sink_for, ClipSink, ClipSummary, ClipTarget, ClipWriter, ContainerKind, MemoryClip,
    MemoryClipSink, RawClipSink, SinkError, RAW_CLIP_MAGIC,
};
