//! Configuration management for the event recorder.
//!
//! This module handles loading and validating configuration from
//! configuration files and environment variables. The configuration is read
//! once at startup and never changes afterwards.

use crate::frame::ObjectClass;
use crate::recording::ContainerKind;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the recorder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecorderConfig {
    /// Capture source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Batch formation configuration
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Detector configuration
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Trigger probe configuration
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Pre-event cache and clip output configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Session event log configuration
    #[serde(default)]
    pub event_log: EventLogConfig,

    /// Queue sizes and topology overrides
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which capture source feeds the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Generated test pattern
    Synthetic,
    /// GStreamer capture pipeline (requires the `gstreamer` feature)
    Camera,
}

/// Capture source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,

    /// Source identifier stamped on every frame
    #[serde(default)]
    pub source_id: u32,

    /// GStreamer source description for `camera`, e.g. "v4l2src device=/dev/video0"
    /// or an rtsp:// URL
    #[serde(default)]
    pub uri: Option<String>,

    /// Capture width in pixels
    #[serde(default = "default_capture_width")]
    pub width: u32,

    /// Capture height in pixels
    #[serde(default = "default_capture_height")]
    pub height: u32,

    /// Capture frame rate
    #[serde(default = "default_capture_fps")]
    pub fps: u32,

    /// Pace synthetic frames in real time (false produces frames as fast as possible)
    #[serde(default = "default_realtime")]
    pub realtime: bool,

    /// End the synthetic stream after this many seconds of video
    #[serde(default)]
    pub stop_after_secs: Option<u64>,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum number of reconnection attempts (0 = infinite)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Base delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

/// Batch formation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Output width of every batched frame
    #[serde(default = "default_batch_width")]
    pub width: u32,

    /// Output height of every batched frame
    #[serde(default = "default_batch_height")]
    pub height: u32,

    /// Frames per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time to wait for a batch to fill in milliseconds
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
}

/// One scripted object appearance for the scripted detector.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedObject {
    pub class: ObjectClass,

    /// Stream time at which the object appears
    pub start_secs: f64,

    /// Stream time at which the object leaves
    pub end_secs: f64,

    /// Number of instances reported per frame
    #[serde(default = "default_script_count")]
    pub count: u32,

    #[serde(default = "default_script_confidence")]
    pub confidence: f32,
}

/// Detector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Detector backend name
    #[serde(default = "default_inference_backend")]
    pub backend: String,

    /// Object appearances reported by the scripted backend
    #[serde(default)]
    pub script: Vec<ScriptedObject>,
}

/// When a fired trigger latch is cleared again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RearmPolicy {
    /// Fire once per process
    Never,
    /// Clear once the session the latch requested has finished or failed to start
    AfterSession,
}

/// Trigger probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    /// Classes whose presence starts a recording
    #[serde(default = "default_trigger_classes")]
    pub classes: Vec<ObjectClass>,

    /// Minimum confidence for a detection to trigger
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Seconds of cached history to prepend to a triggered clip
    #[serde(default = "default_pre_roll_secs")]
    pub pre_roll_secs: u64,

    /// Seconds to record after the trigger (0 = recording default)
    #[serde(default = "default_trigger_duration_secs")]
    pub duration_secs: u64,

    #[serde(default = "default_rearm")]
    pub rearm: RearmPolicy,
}

/// Pre-event cache and clip output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingConfig {
    /// Pre-event cache capacity in seconds of video
    #[serde(default = "default_cache_secs")]
    pub cache_secs: u64,

    /// Session duration used when a start request asks for 0 seconds
    #[serde(default = "default_session_duration_secs")]
    pub default_duration_secs: u64,

    /// Output container for recorded clips
    #[serde(default = "default_container")]
    pub container: ContainerKind,

    /// Directory recorded clips are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Keep overlay annotations in recorded clips
    #[serde(default = "default_annotations_visible")]
    pub annotations_visible: bool,

    /// Extra wall-clock time past the session duration before a stalled
    /// session is stopped, in milliseconds
    #[serde(default = "default_watchdog_grace_ms")]
    pub watchdog_grace_ms: u64,

    /// How long shutdown waits for an active session to finalize
    #[serde(default = "default_finalize_timeout_secs")]
    pub finalize_timeout_secs: u64,
}

/// Session event log configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    /// Append-only log of completed sessions
    #[serde(default = "default_event_log_path")]
    pub path: PathBuf,
}

/// Graph wiring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the queues between upstream stages
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Capacity of the live display branch queue
    #[serde(default = "default_live_queue_size")]
    pub live_queue_size: usize,

    /// Capacity of the record branch queue
    #[serde(default = "default_record_queue_size")]
    pub record_queue_size: usize,

    /// Capacity of the controller command queue
    #[serde(default = "default_command_queue_size")]
    pub command_queue_size: usize,

    /// Force the integrated-display transform stage on or off
    /// (unset = detect the platform)
    #[serde(default)]
    pub integrated_display: Option<bool>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

// Default value functions
fn default_source_kind() -> SourceKind {
    SourceKind::Synthetic
}
fn default_capture_width() -> u32 {
    1280
}
fn default_capture_height() -> u32 {
    720
}
fn default_capture_fps() -> u32 {
    30
}
fn default_realtime() -> bool {
    true
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_max_reconnect_attempts() -> u32 {
    0
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30000
}
fn default_batch_width() -> u32 {
    1920
}
fn default_batch_height() -> u32 {
    1080
}
fn default_batch_size() -> usize {
    1
}
fn default_batch_timeout_ms() -> u64 {
    40
}
fn default_script_count() -> u32 {
    1
}
fn default_script_confidence() -> f32 {
    0.9
}
fn default_inference_backend() -> String {
    "scripted".to_string()
}
fn default_trigger_classes() -> Vec<ObjectClass> {
    vec![ObjectClass::Person]
}
fn default_min_confidence() -> f32 {
    0.5
}
fn default_pre_roll_secs() -> u64 {
    2
}
fn default_trigger_duration_secs() -> u64 {
    7
}
fn default_rearm() -> RearmPolicy {
    RearmPolicy::AfterSession
}
fn default_cache_secs() -> u64 {
    15
}
fn default_session_duration_secs() -> u64 {
    10
}
fn default_container() -> ContainerKind {
    ContainerKind::Raw
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_annotations_visible() -> bool {
    true
}
fn default_watchdog_grace_ms() -> u64 {
    2000
}
fn default_finalize_timeout_secs() -> u64 {
    10
}
fn default_event_log_path() -> PathBuf {
    PathBuf::from("smart_record.log")
}
fn default_queue_size() -> usize {
    100
}
fn default_live_queue_size() -> usize {
    30
}
fn default_record_queue_size() -> usize {
    120
}
fn default_command_queue_size() -> usize {
    16
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            source_id: 0,
            uri: None,
            width: default_capture_width(),
            height: default_capture_height(),
            fps: default_capture_fps(),
            realtime: default_realtime(),
            stop_after_secs: None,
            connection_timeout_secs: default_connection_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            width: default_batch_width(),
            height: default_batch_height(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: default_inference_backend(),
            script: Vec::new(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            classes: default_trigger_classes(),
            min_confidence: default_min_confidence(),
            pre_roll_secs: default_pre_roll_secs(),
            duration_secs: default_trigger_duration_secs(),
            rearm: default_rearm(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            cache_secs: default_cache_secs(),
            default_duration_secs: default_session_duration_secs(),
            container: default_container(),
            output_dir: default_output_dir(),
            annotations_visible: default_annotations_visible(),
            watchdog_grace_ms: default_watchdog_grace_ms(),
            finalize_timeout_secs: default_finalize_timeout_secs(),
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: default_event_log_path(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            live_queue_size: default_live_queue_size(),
            record_queue_size: default_record_queue_size(),
            command_queue_size: default_command_queue_size(),
            integrated_display: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl RecorderConfig {
    /// Load configuration from files in `config_dir` and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file ({config_dir}/default.toml)
    /// 2. Environment-specific config ({config_dir}/{RUN_MODE}.toml)
    /// 3. Environment variables (prefixed with RECORDER_)
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::from(config_dir.join("default")).required(false))
            .add_source(File::from(config_dir.join(&run_mode)).required(false))
            // e.g. RECORDER_RECORDING__CACHE_SECS=20
            .add_source(
                Environment::with_prefix("RECORDER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("RECORDER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.source.kind == SourceKind::Camera && self.source.uri.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigValidationError::MissingField("source.uri".to_string()));
        }
        if self.source.kind == SourceKind::Camera && !cfg!(feature = "gstreamer") {
            return Err(ConfigValidationError::Unsupported {
                field: "source.kind".to_string(),
                message: "camera capture requires the `gstreamer` feature".to_string(),
            });
        }

        if self.source.width == 0 || self.source.height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }
        if self.source.fps == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.fps".to_string(),
                message: "FPS must be greater than 0".to_string(),
            });
        }

        if self.batching.width == 0 || self.batching.height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "batching.width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }
        if self.batching.batch_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "batching.batch_size".to_string(),
                message: "Batch size must be greater than 0".to_string(),
            });
        }

        if self.inference.backend != "scripted" {
            return Err(ConfigValidationError::Unsupported {
                field: "inference.backend".to_string(),
                message: format!("unknown detector backend '{}'", self.inference.backend),
            });
        }

        if self.trigger.classes.is_empty() {
            return Err(ConfigValidationError::MissingField("trigger.classes".to_string()));
        }

        if self.recording.cache_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recording.cache_secs".to_string(),
                message: "Cache capacity must be greater than 0".to_string(),
            });
        }
        if self.recording.default_duration_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recording.default_duration_secs".to_string(),
                message: "Default duration must be greater than 0".to_string(),
            });
        }
        if self.recording.container.requires_gstreamer() && !cfg!(feature = "gstreamer") {
            return Err(ConfigValidationError::Unsupported {
                field: "recording.container".to_string(),
                message: format!(
                    "{} output requires the `gstreamer` feature",
                    self.recording.container.extension()
                ),
            });
        }

        for (field, size) in [
            ("pipeline.queue_size", self.pipeline.queue_size),
            ("pipeline.live_queue_size", self.pipeline.live_queue_size),
            ("pipeline.record_queue_size", self.pipeline.record_queue_size),
            ("pipeline.command_queue_size", self.pipeline.command_queue_size),
        ] {
            if size == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.to_string(),
                    message: "Queue size must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Whether the configured pre-roll fits in the cache.
    pub fn pre_roll_fits_cache(&self) -> bool {
        self.trigger.pre_roll_secs <= self.recording.cache_secs
    }
}

impl SourceConfig {
    /// Interval between frames at the configured rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    /// Get connection timeout as Duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get base reconnection delay as Duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Get maximum reconnection delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl BatchingConfig {
    /// Get batch timeout as Duration.
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

impl TriggerConfig {
    pub fn pre_roll(&self) -> Duration {
        Duration::from_secs(self.pre_roll_secs)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

impl RecordingConfig {
    pub fn cache_capacity(&self) -> Duration {
        Duration::from_secs(self.cache_secs)
    }

    pub fn default_duration(&self) -> Duration {
        Duration::from_secs(self.default_duration_secs)
    }

    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_millis(self.watchdog_grace_ms)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }

    /// File name prefix for clips, which records whether annotations are burned in.
    pub fn file_name_prefix(&self) -> &'static str {
        if self.annotations_visible {
            "With_BBox"
        } else {
            "Without_BBox"
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unsupported setting {field}: {message}")]
    Unsupported { field: String, message: String },
}
