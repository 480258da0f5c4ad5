//! Object detection.
//!
//! Detectors attach a detection list to each frame. The scripted backend
//! reports objects from a configured timeline of appearances, which drives the
//! graph end to end without a model.

use crate::config::{InferenceConfig, ScriptedObject};
use crate::frame::{BoundingBox, Detection, Frame};
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised by detector backends.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Unknown detector backend '{0}'")]
    UnknownBackend(String),

    #[error("Detection failed: {0}")]
    DetectionFailed(String),
}

/// Detector backend.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError>;
}

/// Reports objects according to a timeline keyed on stream time.
pub struct ScriptedDetector {
    script: Vec<ScriptedObject>,
}

impl ScriptedDetector {
    pub fn new(script: Vec<ScriptedObject>) -> Self {
        Self { script }
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        let t = frame.pts.as_secs_f64();
        let mut detections = Vec::new();

        for object in self.script.iter().filter(|o| t >= o.start_secs && t < o.end_secs) {
            for i in 0..object.count {
                detections.push(Detection::new(
                    object.class,
                    placement(i, object.count, frame.width, frame.height),
                    object.confidence,
                ));
            }
        }

        Ok(detections)
    }
}

/// Spread `count` boxes across the middle band of the frame.
fn placement(index: u32, count: u32, width: u32, height: u32) -> BoundingBox {
    let slot = width as f32 / count.max(1) as f32;
    BoundingBox::new(
        slot * index as f32 + slot * 0.25,
        height as f32 * 0.25,
        slot * 0.5,
        height as f32 * 0.5,
    )
}

/// Build the configured detector backend.
pub fn detector_for(config: &InferenceConfig) -> Result<Box<dyn Detector>, InferenceError> {
    match config.backend.as_str() {
        "scripted" => {
            info!(objects = config.script.len(), "Using scripted detector");
            Ok(Box::new(ScriptedDetector::new(config.script.clone())))
        }
        other => Err(InferenceError::UnknownBackend(other.to_string())),
    }
}

/// Attach detections to a frame. A failed detection leaves the metadata missing.
pub fn annotate(detector: &mut dyn Detector, frame: &mut Frame) {
    match detector.detect(frame) {
        Ok(detections) => frame.detections = Some(detections),
        Err(e) => {
            warn!(
                backend = detector.name(),
                sequence = frame.sequence,
                error = %e,
                "Detection failed, frame has no metadata"
            );
            frame.detections = None;
        }
    }
}
