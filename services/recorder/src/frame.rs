//! Frame, detection and overlay types shared by every stage of the graph.
//!
//! A [`Frame`] moves stage-to-stage by value. The payload is a [`Bytes`]
//! handle, so the branch splitter can give each branch its own copy without
//! duplicating pixel data.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Object classes produced by the detection model.
///
/// The discriminants are the model's class ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Vehicle = 0,
    TwoWheeler = 1,
    Person = 2,
    RoadSign = 3,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 4] = [
        ObjectClass::Vehicle,
        ObjectClass::TwoWheeler,
        ObjectClass::Person,
        ObjectClass::RoadSign,
    ];

    /// Map a raw model class id to a known class.
    pub fn from_class_id(class_id: u32) -> Option<Self> {
        match class_id {
            0 => Some(ObjectClass::Vehicle),
            1 => Some(ObjectClass::TwoWheeler),
            2 => Some(ObjectClass::Person),
            3 => Some(ObjectClass::RoadSign),
            _ => None,
        }
    }

    pub fn class_id(self) -> u32 {
        self as u32
    }

    pub fn label(self) -> &'static str {
        match self {
            ObjectClass::Vehicle => "Vehicle",
            ObjectClass::TwoWheeler => "TwoWheeler",
            ObjectClass::Person => "Person",
            ObjectClass::RoadSign => "Roadsign",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    fn is_well_formed(&self) -> bool {
        [self.left, self.top, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width >= 0.0
            && self.height >= 0.0
    }
}

/// A single object reported by inference for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Raw class id as reported by the model
    pub class_id: u32,

    pub bbox: BoundingBox,

    pub confidence: f32,
}

impl Detection {
    pub fn new(class: ObjectClass, bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            class_id: class.class_id(),
            bbox,
            confidence,
        }
    }

    /// The detection's class, if the id is known and the box and
    /// confidence are sane.
    pub fn validated_class(&self) -> Option<ObjectClass> {
        if !self.bbox.is_well_formed() {
            return None;
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return None;
        }
        ObjectClass::from_class_id(self.class_id)
    }
}

/// Per-frame detection counts, indexed by class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts([u32; 4]);

impl ClassCounts {
    pub fn increment(&mut self, class: ObjectClass) {
        self.0[class.index()] += 1;
    }

    pub fn get(&self, class: ObjectClass) -> u32 {
        self.0[class.index()]
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    /// Vehicles plus people, the objects the per-frame summary reports.
    pub fn reported(&self) -> u32 {
        self.get(ObjectClass::Vehicle) + self.get(ObjectClass::Person)
    }
}

/// RGBA color with components in 0..=1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub alpha: f32,
}

impl Color {
    pub const WHITE: Color = Color {
        red: 1.0,
        green: 1.0,
        blue: 1.0,
        alpha: 1.0,
    };

    pub const BLACK: Color = Color {
        red: 0.0,
        green: 0.0,
        blue: 0.0,
        alpha: 1.0,
    };
}

/// Text label the overlay renderer draws on a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayAnnotation {
    pub text: String,
    pub x_offset: u32,
    pub y_offset: u32,
    pub font_name: &'static str,
    pub font_size: u32,
    pub font_color: Color,
    pub background: Option<Color>,
}

impl OverlayAnnotation {
    /// Build the class-count label shown on screen.
    pub fn for_counts(counts: &ClassCounts) -> Self {
        let text = format!(
            "Person = {} Vehicle = {} ",
            counts.get(ObjectClass::Person),
            counts.get(ObjectClass::Vehicle)
        );

        Self {
            text,
            x_offset: 10,
            y_offset: 12,
            font_name: "Serif",
            font_size: 10,
            font_color: Color::WHITE,
            background: Some(Color::BLACK),
        }
    }
}

/// A video frame flowing through the graph.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Source (camera) identifier
    pub source_id: u32,

    /// Batch the frame was grouped into by batch formation
    pub batch_id: u64,

    /// Per-source sequence number
    pub sequence: u64,

    /// Presentation timestamp on the stream clock
    pub pts: Duration,

    pub width: u32,
    pub height: u32,

    /// Raw pixels before the record branch encoder, encoded bytes after
    pub payload: Bytes,

    /// Detections attached by inference. `None` means the metadata is missing.
    pub detections: Option<Vec<Detection>>,

    /// Label attached by the trigger probe
    pub overlay: Option<OverlayAnnotation>,
}

impl Frame {
    pub fn new(source_id: u32, sequence: u64, pts: Duration, width: u32, height: u32, payload: Bytes) -> Self {
        Self {
            source_id,
            batch_id: 0,
            sequence,
            pts,
            width,
            height,
            payload,
            detections: None,
            overlay: None,
        }
    }

    /// Drop per-frame metadata, leaving only the picture.
    pub fn strip_annotations(&mut self) {
        self.detections = None;
        self.overlay = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_id_mapping() {
        for class in ObjectClass::ALL {
            assert_eq!(ObjectClass::from_class_id(class.class_id()), Some(class));
        }
        assert_eq!(ObjectClass::from_class_id(7), None);
        assert_eq!(ObjectClass::Person.class_id(), 2);
    }

    #[test]
    fn test_malformed_detection_rejected() {
        let good = Detection::new(ObjectClass::Person, BoundingBox::new(1.0, 2.0, 3.0, 4.0), 0.9);
        assert_eq!(good.validated_class(), Some(ObjectClass::Person));

        let mut nan_box = good.clone();
        nan_box.bbox.left = f32::NAN;
        assert_eq!(nan_box.validated_class(), None);

        let mut bad_conf = good.clone();
        bad_conf.confidence = 1.5;
        assert_eq!(bad_conf.validated_class(), None);

        let mut unknown = good;
        unknown.class_id = 42;
        assert_eq!(unknown.validated_class(), None);
    }

    #[test]
    fn test_overlay_text() {
        let mut counts = ClassCounts::default();
        counts.increment(ObjectClass::Person);
        counts.increment(ObjectClass::Person);
        counts.increment(ObjectClass::Vehicle);
        counts.increment(ObjectClass::RoadSign);

        let overlay = OverlayAnnotation::for_counts(&counts);
        assert_eq!(overlay.text, "Person = 2 Vehicle = 1 ");
        assert_eq!(overlay.x_offset, 10);
        assert_eq!(overlay.y_offset, 12);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_reported_count_skips_other_classes() {
        let mut counts = ClassCounts::default();
        counts.increment(ObjectClass::Vehicle);
        counts.increment(ObjectClass::Person);
        counts.increment(ObjectClass::TwoWheeler);
        counts.increment(ObjectClass::RoadSign);
        counts.increment(ObjectClass::RoadSign);

        assert_eq!(counts.reported(), 2);
        assert_eq!(counts.total(), 5);
    }

    #[test]
    fn test_strip_annotations() {
        let mut frame = Frame::new(0, 0, Duration::ZERO, 2, 2, Bytes::from_static(&[0u8; 12]));
        frame.detections = Some(vec![]);
        frame.overlay = Some(OverlayAnnotation::for_counts(&ClassCounts::default()));
        frame.strip_annotations();
        assert!(frame.detections.is_none());
        assert!(frame.overlay.is_none());
    }
}
