//! Overlay rendering and the live display branch.

use crate::frame::Frame;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Draws a frame's overlay annotation.
pub trait OverlayRenderer: Send {
    fn name(&self) -> &'static str;

    fn render(&mut self, frame: &mut Frame);
}

/// Keeps the overlay as frame metadata for downstream consumers instead of
/// drawing into the pixels.
#[derive(Debug, Default)]
pub struct MetadataRenderer {
    rendered: u64,
    skipped: u64,
}

impl MetadataRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames that carried an overlay, and frames that did not.
    pub fn counts(&self) -> (u64, u64) {
        (self.rendered, self.skipped)
    }
}

impl OverlayRenderer for MetadataRenderer {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn render(&mut self, frame: &mut Frame) {
        match &frame.overlay {
            Some(overlay) => {
                self.rendered += 1;
                trace!(
                    sequence = frame.sequence,
                    text = %overlay.text,
                    x = overlay.x_offset,
                    y = overlay.y_offset,
                    "Overlay rendered"
                );
            }
            None => self.skipped += 1,
        }
    }
}

/// Consumer at the end of the live branch.
pub trait LiveSink: Send {
    fn name(&self) -> &'static str;

    fn show(&mut self, frame: &Frame);
}

/// Statistics for the live display.
#[derive(Debug, Default, Clone)]
pub struct DisplayStats {
    pub frames_shown: u64,
    pub current_fps: f64,
    pub last_overlay: Option<String>,
}

/// Headless display that tracks the frame rate and the newest overlay text.
pub struct StatsDisplaySink {
    stats: DisplayStats,
    window_start: Instant,
    window_frames: u64,
    report_interval: Duration,
}

impl StatsDisplaySink {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            stats: DisplayStats::default(),
            window_start: Instant::now(),
            window_frames: 0,
            report_interval,
        }
    }

    pub fn stats(&self) -> DisplayStats {
        self.stats.clone()
    }
}

impl Default for StatsDisplaySink {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl LiveSink for StatsDisplaySink {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn show(&mut self, frame: &Frame) {
        self.stats.frames_shown += 1;
        self.window_frames += 1;
        if let Some(overlay) = &frame.overlay {
            if self.stats.last_overlay.as_deref() != Some(overlay.text.as_str()) {
                self.stats.last_overlay = Some(overlay.text.clone());
            }
        }

        let elapsed = self.window_start.elapsed();
        if elapsed >= self.report_interval {
            self.stats.current_fps = self.window_frames as f64 / elapsed.as_secs_f64();
            debug!(
                fps = format!("{:.2}", self.stats.current_fps),
                frames_shown = self.stats.frames_shown,
                overlay = self.stats.last_overlay.as_deref().unwrap_or(""),
                "Live display"
            );
            self.window_start = Instant::now();
            self.window_frames = 0;
        }
    }
}

/// Converts packed RGB to RGBA for integrated displays, whose surfaces take
/// four bytes per pixel.
#[derive(Debug, Default)]
pub struct DisplayTransform {
    converted: u64,
}

impl DisplayTransform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn converted(&self) -> u64 {
        self.converted
    }

    pub fn apply(&mut self, mut frame: Frame) -> Frame {
        let pixels = frame.width as usize * frame.height as usize;
        if pixels == 0 || frame.payload.len() != pixels * 3 {
            return frame;
        }

        let mut rgba = Vec::with_capacity(pixels * 4);
        for px in frame.payload.chunks_exact(3) {
            rgba.extend_from_slice(px);
            rgba.push(u8::MAX);
        }
        frame.payload = Bytes::from(rgba);
        self.converted += 1;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ClassCounts, ObjectClass, OverlayAnnotation};

    fn frame() -> Frame {
        Frame::new(0, 0, Duration::ZERO, 2, 1, Bytes::from_static(&[1, 2, 3, 4, 5, 6]))
    }

    #[test]
    fn test_metadata_renderer_counts() {
        let mut renderer = MetadataRenderer::new();
        let mut with = frame();
        with.overlay = Some(OverlayAnnotation::for_counts(&ClassCounts::default()));
        renderer.render(&mut with);
        renderer.render(&mut frame());
        assert_eq!(renderer.counts(), (1, 1));
    }

    #[test]
    fn test_stats_sink_tracks_overlay() {
        let mut sink = StatsDisplaySink::new(Duration::ZERO);
        let mut counts = ClassCounts::default();
        counts.increment(ObjectClass::Person);
        let mut f = frame();
        f.overlay = Some(OverlayAnnotation::for_counts(&counts));

        sink.show(&f);
        sink.show(&frame());
        let stats = sink.stats();
        assert_eq!(stats.frames_shown, 2);
        assert_eq!(stats.last_overlay.as_deref(), Some("Person = 1 Vehicle = 0 "));
    }

    #[test]
    fn test_display_transform_expands_to_rgba() {
        let mut transform = DisplayTransform::new();
        let out = transform.apply(frame());
        assert_eq!(&out.payload[..], &[1, 2, 3, 255, 4, 5, 6, 255]);
        assert_eq!(transform.converted(), 1);

        // Non-RGB payloads pass through
        let mut odd = frame();
        odd.payload = Bytes::from_static(b"jpeg");
        assert_eq!(&transform.apply(odd).payload[..], b"jpeg");
    }
}
