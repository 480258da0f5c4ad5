//! Detection-triggered event recorder.
//!
//! Watches a live camera stream, runs object detection on every frame, and
//! when a trigger class appears records a clip that starts a configurable
//! pre-roll before the trigger. Each completed clip is summarized in an
//! append-only session log.
//!
//! # Architecture
//!
//! ```text
//! FrameSource -> Batcher -> Detector -> TriggerProbe -> BranchSplitter
//!                                            |            |-> live display
//!                                            |            '-> record branch
//!                                            v                   |
//!                                   RecordingController <--------'
//!                                   (PreEventCache, ClipSink)
//!                                            |
//!                                            v
//!                                   SessionEventLogger
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with RECORDER_)
//!
//! See `config.rs` for detailed configuration options.

pub mod batcher;
pub mod config;
pub mod display;
pub mod event_log;
pub mod frame;
pub mod inference;
pub mod pipeline;
pub mod probe;
pub mod recording;
pub mod source;
pub mod splitter;

pub use config::RecorderConfig;
pub use event_log::SessionEventLogger;
pub use frame::{Detection, Frame, ObjectClass};
pub use pipeline::{Pipeline, PipelineError, RunSummary, Termination};
pub use probe::TriggerProbe;
pub use recording::{RecordingController, SessionCompleted, SessionId, StartRequest};
pub use splitter::BranchSplitter;
