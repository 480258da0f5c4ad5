//! GStreamer clip sink: encodes raw RGB frames to H.264 and muxes them into
//! MP4 or Matroska.
//!
//! Pipeline: appsrc -> videoconvert -> x264enc -> h264parse -> mux -> filesink

use super::sink::{ClipSink, ClipSummary, ClipTarget, ClipWriter, ContainerKind, SinkError};
use crate::frame::Frame;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// How long finalize waits for the muxer to drain.
const EOS_TIMEOUT_SECS: u64 = 5;

pub struct GstClipSink;

impl GstClipSink {
    pub fn new() -> Result<Self, SinkError> {
        gst::init().map_err(|e| SinkError::Open(format!("GStreamer init failed: {}", e)))?;
        Ok(Self)
    }

    fn build_pipeline_string(target: &ClipTarget) -> Result<String, SinkError> {
        let muxer = match target.container {
            ContainerKind::Mp4 => "mp4mux faststart=true",
            ContainerKind::Mkv => "matroskamux writing-app=eventcam",
            ContainerKind::Raw => return Err(SinkError::Unsupported(ContainerKind::Raw)),
        };

        Ok(format!(
            "appsrc name=src format=time is-live=true ! \
             videoconvert ! \
             x264enc tune=zerolatency speed-preset=veryfast ! \
             h264parse ! \
             {} ! \
             filesink location=\"{}\" async=false",
            muxer,
            target.path.display()
        ))
    }
}

impl ClipSink for GstClipSink {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn open(&self, target: &ClipTarget) -> Result<Box<dyn ClipWriter>, SinkError> {
        if let Some(parent) = target.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pipeline_str = Self::build_pipeline_string(target)?;
        debug!(pipeline = %pipeline_str, "Creating clip pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| SinkError::Open(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SinkError::Open("Failed to downcast to Pipeline".to_string()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| SinkError::Open("appsrc not found".to_string()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| SinkError::Open("Failed to downcast to AppSrc".to_string()))?;

        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, target.width, target.height)
            .fps(gst::Fraction::new(target.fps as i32, 1))
            .build()
            .map_err(|e| SinkError::Open(format!("Invalid video info: {}", e)))?;
        let caps = info
            .to_caps()
            .map_err(|e| SinkError::Open(format!("Invalid caps: {}", e)))?;
        appsrc.set_caps(Some(&caps));

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SinkError::Open(format!("Failed to start clip pipeline: {:?}", e)))?;

        Ok(Box::new(GstClipWriter {
            pipeline,
            appsrc,
            path: target.path.clone(),
            frame_duration: Duration::from_secs(1) / target.fps.max(1),
            base_pts: None,
            frames: 0,
        }))
    }
}

struct GstClipWriter {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    path: PathBuf,
    frame_duration: Duration,
    base_pts: Option<Duration>,
    frames: u64,
}

impl ClipWriter for GstClipWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let base = *self.base_pts.get_or_insert(frame.pts);
        let pts = frame.pts.saturating_sub(base);

        let mut buffer = gst::Buffer::from_slice(frame.payload.clone());
        if let Some(buffer_ref) = buffer.get_mut() {
            buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts.as_nanos() as u64));
            buffer_ref.set_duration(gst::ClockTime::from_nseconds(
                self.frame_duration.as_nanos() as u64,
            ));
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| SinkError::Write(format!("Failed to push buffer: {:?}", e)))?;
        self.frames += 1;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<ClipSummary, SinkError> {
        if let Err(e) = self.appsrc.end_of_stream() {
            warn!(error = ?e, "Failed to send EOS to clip pipeline");
        }

        let mut pipeline_error = None;
        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        pipeline_error = Some(format!("{} ({:?})", err.error(), err.debug()));
                        break;
                    }
                    _ => {}
                }
            }
        }

        let _ = self.pipeline.set_state(gst::State::Null);

        if let Some(err) = pipeline_error {
            return Err(SinkError::Finalize(err));
        }

        let bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        Ok(ClipSummary {
            frames: self.frames,
            bytes,
        })
    }
}

impl Drop for GstClipWriter {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_string_selects_muxer() {
        let mut target = ClipTarget {
            path: PathBuf::from("/tmp/clip.mp4"),
            width: 640,
            height: 360,
            fps: 30,
            container: ContainerKind::Mp4,
        };
        let mp4 = GstClipSink::build_pipeline_string(&target).unwrap();
        assert!(mp4.contains("mp4mux"));
        assert!(mp4.contains("location=\"/tmp/clip.mp4\""));

        target.container = ContainerKind::Mkv;
        assert!(GstClipSink::build_pipeline_string(&target)
            .unwrap()
            .contains("matroskamux"));

        target.container = ContainerKind::Raw;
        assert!(GstClipSink::build_pipeline_string(&target).is_err());
    }
}
