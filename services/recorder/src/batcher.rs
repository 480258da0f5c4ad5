//! Batch formation.
//!
//! Scales every incoming frame to the batch resolution and groups frames into
//! batches of a fixed size. A partially filled batch is flushed once the batch
//! timeout has passed since its first frame.

use crate::config::BatchingConfig;
use crate::frame::Frame;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tracing::{debug, info, trace, warn};

/// A group of frames processed together by inference.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: u64,
    pub frames: Vec<Frame>,
}

/// Statistics for batch formation.
#[derive(Debug, Default, Clone)]
pub struct BatcherStats {
    pub frames_batched: u64,
    pub frames_rescaled: u64,
    /// Frames whose payload did not match their dimensions and were passed on unscaled
    pub frames_unscaled: u64,
    pub batches_full: u64,
    pub batches_timed_out: u64,
    pub total_scale_time_us: u64,
}

/// Groups frames into fixed-resolution batches.
pub struct Batcher {
    config: BatchingConfig,
    stats: Arc<RwLock<BatcherStats>>,
    next_batch_id: u64,
}

impl Batcher {
    /// Create a new batcher.
    pub fn new(config: BatchingConfig) -> Self {
        Self {
            config,
            stats: Arc::new(RwLock::new(BatcherStats::default())),
            next_batch_id: 0,
        }
    }

    /// Get current batcher statistics.
    pub fn stats(&self) -> BatcherStats {
        self.stats.read().clone()
    }

    /// Shared handle to the statistics, readable after `run` has consumed the batcher.
    pub fn stats_handle(&self) -> Arc<RwLock<BatcherStats>> {
        self.stats.clone()
    }

    /// Form batches until the input closes or the output is dropped.
    pub async fn run(mut self, mut input: mpsc::Receiver<Frame>, output: mpsc::Sender<Batch>) {
        info!(
            width = self.config.width,
            height = self.config.height,
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout_ms,
            "Batch formation started"
        );

        let mut pending: Vec<Frame> = Vec::with_capacity(self.config.batch_size);
        let mut deadline = tokio::time::Instant::now();

        loop {
            let next = if pending.is_empty() {
                input.recv().await
            } else {
                tokio::select! {
                    frame = input.recv() => frame,
                    _ = sleep_until(deadline) => {
                        self.stats.write().batches_timed_out += 1;
                        trace!(frames = pending.len(), "Batch timeout, flushing partial batch");
                        if !self.flush(&mut pending, &output).await {
                            break;
                        }
                        continue;
                    }
                }
            };

            let Some(frame) = next else {
                if !pending.is_empty() {
                    self.flush(&mut pending, &output).await;
                }
                info!("Input channel closed");
                break;
            };

            if pending.is_empty() {
                deadline = tokio::time::Instant::now() + self.config.batch_timeout();
            }
            pending.push(self.scale(frame));

            if pending.len() >= self.config.batch_size {
                self.stats.write().batches_full += 1;
                if !self.flush(&mut pending, &output).await {
                    break;
                }
            }
        }

        info!("Batch formation stopped");
    }

    /// Send the pending frames as one batch. Returns false once the output is closed.
    async fn flush(&mut self, pending: &mut Vec<Frame>, output: &mpsc::Sender<Batch>) -> bool {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let mut frames = std::mem::take(pending);
        for frame in &mut frames {
            frame.batch_id = batch_id;
        }
        self.stats.write().frames_batched += frames.len() as u64;

        if output.send(Batch { batch_id, frames }).await.is_err() {
            debug!(batch_id, "Batch output closed");
            return false;
        }
        true
    }

    /// Scale a frame to the batch resolution.
    fn scale(&self, mut frame: Frame) -> Frame {
        let (dst_width, dst_height) = (self.config.width, self.config.height);
        if frame.width == dst_width && frame.height == dst_height {
            return frame;
        }

        let expected = frame.width as usize * frame.height as usize * 3;
        if expected == 0 || frame.payload.len() != expected {
            let mut stats = self.stats.write();
            stats.frames_unscaled += 1;
            if stats.frames_unscaled == 1 {
                warn!(
                    width = frame.width,
                    height = frame.height,
                    payload_len = frame.payload.len(),
                    "Frame payload is not packed RGB, passing through unscaled"
                );
            }
            return frame;
        }

        let start = Instant::now();
        let scaled = resize_rgb(&frame.payload, frame.width, frame.height, dst_width, dst_height);
        frame.payload = Bytes::from(scaled);
        frame.width = dst_width;
        frame.height = dst_height;

        let mut stats = self.stats.write();
        stats.frames_rescaled += 1;
        stats.total_scale_time_us += start.elapsed().as_micros() as u64;
        frame
    }
}

/// Nearest-neighbour resize of a packed RGB image.
fn resize_rgb(data: &[u8], src_width: u32, src_height: u32, dst_width: u32, dst_height: u32) -> Vec<u8> {
    let mut output = vec![0u8; dst_width as usize * dst_height as usize * 3];

    let x_ratio = src_width as f32 / dst_width as f32;
    let y_ratio = src_height as f32 / dst_height as f32;

    for y in 0..dst_height {
        let src_y = ((y as f32 * y_ratio) as u32).min(src_height - 1);
        for x in 0..dst_width {
            let src_x = ((x as f32 * x_ratio) as u32).min(src_width - 1);

            let src_idx = (src_y as usize * src_width as usize + src_x as usize) * 3;
            let dst_idx = (y as usize * dst_width as usize + x as usize) * 3;
            output[dst_idx..dst_idx + 3].copy_from_slice(&data[src_idx..src_idx + 3]);
        }
    }

    output
}
