//! Frame sources feeding the graph.
//!
//! A source produces timestamped frames at a known rate. Its frame channel
//! closes at end of stream or after a fatal error; [`FrameSource::last_error`]
//! tells the two apart.

#[cfg(feature = "gstreamer")]
mod gst;

#[cfg(feature = "gstreamer")]
pub use gst::GstCameraSource;

use crate::config::{SourceConfig, SourceKind};
use crate::frame::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Errors raised by frame sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("GStreamer initialization failed: {0}")]
    GstreamerInit(String),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("Stream connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,

    #[error("Source already started")]
    AlreadyStarted,

    #[error("Source kind {0:?} is not supported by this build")]
    Unsupported(SourceKind),
}

/// Statistics for a frame source.
#[derive(Debug, Default, Clone)]
pub struct SourceStats {
    pub frames_produced: u64,
    pub frames_dropped: u64,
    pub bytes_produced: u64,
    pub reconnect_count: u32,
    pub current_fps: f64,
    pub stream_start: Option<Instant>,
}

impl SourceStats {
    fn record(&mut self, bytes: usize) {
        self.frames_produced += 1;
        self.bytes_produced += bytes as u64;
        if let Some(start) = self.stream_start {
            let elapsed = start.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                self.current_fps = self.frames_produced as f64 / elapsed;
            }
        }
    }
}

/// Capture collaborator.
#[async_trait]
pub trait FrameSource: Send {
    fn name(&self) -> &'static str;

    /// Start producing frames into a channel of `capacity` frames.
    async fn start(&mut self, capacity: usize) -> Result<mpsc::Receiver<Frame>, SourceError>;

    /// Stop producing; the frame channel closes.
    async fn stop(&mut self);

    fn stats(&self) -> SourceStats;

    /// Runtime error that ended the stream, if any.
    fn last_error(&self) -> Option<String> {
        None
    }
}

/// Build the configured source.
pub fn source_for(config: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    match config.kind {
        SourceKind::Synthetic => Ok(Box::new(SyntheticSource::new(config.clone()))),
        #[cfg(feature = "gstreamer")]
        SourceKind::Camera => Ok(Box::new(GstCameraSource::new(config.clone())?)),
        #[cfg(not(feature = "gstreamer"))]
        SourceKind::Camera => Err(SourceError::Unsupported(SourceKind::Camera)),
    }
}

/// Number of distinct pattern frames, one second of motion.
fn pattern_len(fps: u32) -> usize {
    fps.max(1) as usize
}

/// Generated test pattern: a bright bar sweeping across a grey field.
pub struct SyntheticSource {
    config: SourceConfig,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<SourceStats>>,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(SourceStats::default())),
        }
    }

    /// Pre-render the pattern so every frame shares one of a few payloads.
    fn render_pattern(width: u32, height: u32, fps: u32) -> Vec<Bytes> {
        let count = pattern_len(fps);
        let bar_width = (width / 16).max(1);

        (0..count)
            .map(|i| {
                let bar_start = (width as usize * i / count) as u32;
                let mut data = vec![96u8; width as usize * height as usize * 3];
                for row in data.chunks_exact_mut(width as usize * 3) {
                    for x in bar_start..(bar_start + bar_width).min(width) {
                        let idx = x as usize * 3;
                        row[idx..idx + 3].copy_from_slice(&[230, 230, 230]);
                    }
                }
                Bytes::from(data)
            })
            .collect()
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn start(&mut self, capacity: usize) -> Result<mpsc::Receiver<Frame>, SourceError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SourceError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let config = self.config.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();
        let pattern = Self::render_pattern(config.width, config.height, config.fps);
        let total_frames = config.stop_after_secs.map(|s| s * config.fps as u64);

        info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            realtime = config.realtime,
            stop_after_secs = ?config.stop_after_secs,
            "Synthetic source started"
        );
        stats.write().stream_start = Some(Instant::now());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.frame_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let fps = config.fps.max(1) as u64;
            let mut sequence = 0u64;

            while running.load(Ordering::SeqCst) {
                if total_frames.is_some_and(|total| sequence >= total) {
                    info!(frames = sequence, "Synthetic source reached end of stream");
                    break;
                }

                let payload = pattern[sequence as usize % pattern.len()].clone();
                let pts = Duration::from_nanos(sequence * 1_000_000_000 / fps);
                let frame = Frame::new(
                    config.source_id,
                    sequence,
                    pts,
                    config.width,
                    config.height,
                    payload,
                );
                let bytes = frame.payload.len();
                sequence += 1;

                if config.realtime {
                    ticker.tick().await;
                    match tx.try_send(frame) {
                        Ok(()) => stats.write().record(bytes),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            stats.write().frames_dropped += 1;
                            debug!(sequence, "Frame dropped due to backpressure");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                } else {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                    stats.write().record(bytes);
                }
            }

            running.store(false, Ordering::SeqCst);
            debug!("Synthetic source task stopped");
        });

        Ok(rx)
    }

    async fn stop(&mut self) {
        info!("Stopping synthetic source");
        self.running.store(false, Ordering::SeqCst);
    }

    fn stats(&self) -> SourceStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> SourceConfig {
        SourceConfig {
            width: 32,
            height: 16,
            fps: 10,
            realtime: false,
            stop_after_secs: Some(2),
            ..SourceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_synthetic_end_of_stream() {
        let mut source = SyntheticSource::new(create_test_config());
        let mut rx = source.start(4).await.unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }

        assert_eq!(frames.len(), 20);
        assert_eq!(frames[10].pts, Duration::from_secs(1));
        assert!(frames.windows(2).all(|w| w[0].pts < w[1].pts));
        assert_eq!(frames[0].payload.len(), 32 * 16 * 3);
        assert_eq!(source.stats().frames_produced, 20);
    }

    #[tokio::test]
    async fn test_pattern_payloads_are_shared() {
        let mut source = SyntheticSource::new(create_test_config());
        let mut rx = source.start(32).await.unwrap();
        let first = rx.recv().await.unwrap();
        for _ in 0..9 {
            rx.recv().await.unwrap();
        }
        let eleventh = rx.recv().await.unwrap();
        assert_eq!(first.payload.as_ptr(), eleventh.payload.as_ptr());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let mut config = create_test_config();
        config.stop_after_secs = None;
        let mut source = SyntheticSource::new(config);
        let _rx = source.start(4).await.unwrap();
        assert!(matches!(
            source.start(4).await,
            Err(SourceError::AlreadyStarted)
        ));
        source.stop().await;
    }

    #[cfg(not(feature = "gstreamer"))]
    #[test]
    fn test_camera_unsupported_without_gstreamer() {
        let mut config = create_test_config();
        config.kind = SourceKind::Camera;
        assert!(matches!(
            source_for(&config),
            Err(SourceError::Unsupported(SourceKind::Camera))
        ));
    }
}
