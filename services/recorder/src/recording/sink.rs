//! Clip sinks: the encode and mux stage a session attaches while recording.
//!
//! A [`ClipSink`] opens one [`ClipWriter`] per session. Writers receive frames
//! in order and are finalized on a blocking worker once the session stops.

use crate::frame::Frame;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Magic bytes at the start of a raw clip file.
pub const RAW_CLIP_MAGIC: &[u8; 8] = b"EVCLIP01";

/// Errors raised by clip sinks and writers.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to open clip: {0}")]
    Open(String),

    #[error("Failed to write frame: {0}")]
    Write(String),

    #[error("Failed to finalize clip: {0}")]
    Finalize(String),

    #[error("Container {0:?} is not supported by this build")]
    Unsupported(ContainerKind),
}

/// Output container for recorded clips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Length-prefixed frame records, no encoding
    Raw,
    Mp4,
    Mkv,
}

impl ContainerKind {
    pub fn extension(self) -> &'static str {
        match self {
            ContainerKind::Raw => "rawv",
            ContainerKind::Mp4 => "mp4",
            ContainerKind::Mkv => "mkv",
        }
    }

    pub fn requires_gstreamer(self) -> bool {
        !matches!(self, ContainerKind::Raw)
    }
}

/// Where and how a session's clip is written.
#[derive(Debug, Clone)]
pub struct ClipTarget {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub container: ContainerKind,
}

/// What a finalized writer produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClipSummary {
    pub frames: u64,
    pub bytes: u64,
}

/// Factory for per-session clip writers.
pub trait ClipSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open the output for a new session. May block on I/O.
    fn open(&self, target: &ClipTarget) -> Result<Box<dyn ClipWriter>, SinkError>;
}

/// Encoder and muxer for one clip.
pub trait ClipWriter: Send {
    /// Append a frame. Frames arrive in presentation order.
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError>;

    /// Flush and close the output. May block until the muxer is done.
    fn finalize(self: Box<Self>) -> Result<ClipSummary, SinkError>;
}

/// Select the sink for a container.
pub fn sink_for(container: ContainerKind) -> Result<Arc<dyn ClipSink>, SinkError> {
    match container {
        ContainerKind::Raw => Ok(Arc::new(RawClipSink)),
        #[cfg(feature = "gstreamer")]
        ContainerKind::Mp4 | ContainerKind::Mkv => Ok(Arc::new(super::gst_sink::GstClipSink::new()?)),
        #[cfg(not(feature = "gstreamer"))]
        other => Err(SinkError::Unsupported(other)),
    }
}

/// Writes frames unencoded into a simple container.
///
/// Layout: magic, width (u32 LE), height (u32 LE), fps (u32 LE), then per
/// frame: pts in nanoseconds relative to the first frame (u64 LE), payload
/// length (u32 LE), payload.
pub struct RawClipSink;

impl ClipSink for RawClipSink {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn open(&self, target: &ClipTarget) -> Result<Box<dyn ClipWriter>, SinkError> {
        if let Some(parent) = target.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(&target.path)?;
        let mut out = BufWriter::new(file);
        out.write_all(RAW_CLIP_MAGIC)?;
        out.write_all(&target.width.to_le_bytes())?;
        out.write_all(&target.height.to_le_bytes())?;
        out.write_all(&target.fps.to_le_bytes())?;

        Ok(Box::new(RawClipWriter {
            out,
            base_pts: None,
            summary: ClipSummary {
                frames: 0,
                bytes: (RAW_CLIP_MAGIC.len() + 12) as u64,
            },
        }))
    }
}

struct RawClipWriter {
    out: BufWriter<File>,
    base_pts: Option<Duration>,
    summary: ClipSummary,
}

impl ClipWriter for RawClipWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let base = *self.base_pts.get_or_insert(frame.pts);
        let relative = frame.pts.saturating_sub(base).as_nanos() as u64;
        let len = u32::try_from(frame.payload.len())
            .map_err(|_| SinkError::Write(format!("frame of {} bytes too large", frame.payload.len())))?;

        self.out.write_all(&relative.to_le_bytes())?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(&frame.payload)?;

        self.summary.frames += 1;
        self.summary.bytes += 12 + frame.payload.len() as u64;
        Ok(())
    }

    fn finalize(mut self: Box<Self>) -> Result<ClipSummary, SinkError> {
        self.out.flush()?;
        let file = self
            .out
            .into_inner()
            .map_err(|e| SinkError::Finalize(e.to_string()))?;
        file.sync_all()?;
        Ok(self.summary)
    }
}

/// A clip kept in memory by [`MemoryClipSink`].
#[derive(Debug, Clone, Default)]
pub struct MemoryClip {
    pub path: PathBuf,
    /// Timestamps of the written frames, in write order
    pub frame_pts: Vec<Duration>,
    pub finalized: bool,
}

/// Keeps clips in memory instead of writing files; for dry runs and tests.
#[derive(Clone, Default)]
pub struct MemoryClipSink {
    clips: Arc<Mutex<Vec<MemoryClip>>>,
}

impl MemoryClipSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every clip opened so far.
    pub fn clips(&self) -> Vec<MemoryClip> {
        self.clips.lock().clone()
    }
}

impl ClipSink for MemoryClipSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, target: &ClipTarget) -> Result<Box<dyn ClipWriter>, SinkError> {
        let mut clips = self.clips.lock();
        clips.push(MemoryClip {
            path: target.path.clone(),
            ..MemoryClip::default()
        });

        Ok(Box::new(MemoryClipWriter {
            clips: self.clips.clone(),
            index: clips.len() - 1,
        }))
    }
}

struct MemoryClipWriter {
    clips: Arc<Mutex<Vec<MemoryClip>>>,
    index: usize,
}

impl ClipWriter for MemoryClipWriter {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.clips.lock()[self.index].frame_pts.push(frame.pts);
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<ClipSummary, SinkError> {
        let mut clips = self.clips.lock();
        let clip = &mut clips[self.index];
        clip.finalized = true;
        Ok(ClipSummary {
            frames: clip.frame_pts.len() as u64,
            bytes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame_at(ms: u64) -> Frame {
        Frame::new(0, ms, Duration::from_millis(ms), 2, 2, Bytes::from(vec![7u8; 12]))
    }

    #[test]
    fn test_container_extensions() {
        assert_eq!(ContainerKind::Raw.extension(), "rawv");
        assert_eq!(ContainerKind::Mp4.extension(), "mp4");
        assert!(!ContainerKind::Raw.requires_gstreamer());
        assert!(ContainerKind::Mkv.requires_gstreamer());
    }

    #[test]
    fn test_raw_clip_layout() {
        let dir = tempfile::tempdir().unwrap();
        let target = ClipTarget {
            path: dir.path().join("nested").join("clip.rawv"),
            width: 2,
            height: 2,
            fps: 30,
            container: ContainerKind::Raw,
        };

        let mut writer = RawClipSink.open(&target).unwrap();
        writer.write(&frame_at(1000)).unwrap();
        writer.write(&frame_at(1040)).unwrap();
        let summary = writer.finalize().unwrap();

        let bytes = std::fs::read(&target.path).unwrap();
        assert_eq!(&bytes[..8], RAW_CLIP_MAGIC);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 30);
        // First frame is rebased to zero
        assert_eq!(u64::from_le_bytes(bytes[20..28].try_into().unwrap()), 0);
        let second = 20 + 12 + 12;
        assert_eq!(
            u64::from_le_bytes(bytes[second..second + 8].try_into().unwrap()),
            40_000_000
        );
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.bytes, bytes.len() as u64);
    }

    #[test]
    fn test_memory_sink_records_order() {
        let sink = MemoryClipSink::new();
        let target = ClipTarget {
            path: PathBuf::from("a.rawv"),
            width: 2,
            height: 2,
            fps: 30,
            container: ContainerKind::Raw,
        };
        let mut writer = sink.open(&target).unwrap();
        writer.write(&frame_at(10)).unwrap();
        writer.write(&frame_at(20)).unwrap();
        writer.finalize().unwrap();

        let clips = sink.clips();
        assert_eq!(clips.len(), 1);
        assert!(clips[0].finalized);
        assert_eq!(
            clips[0].frame_pts,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn test_mp4_unsupported_without_gstreamer() {
        assert!(matches!(
            sink_for(ContainerKind::Mp4),
            Err(SinkError::Unsupported(ContainerKind::Mp4))
        ));
        assert!(sink_for(ContainerKind::Raw).is_ok());
    }
}
