//! Pre-event cache: a bounded ring of the most recent record-branch frames.
//!
//! The cache is written on every frame whether or not a session is active, so
//! a newly triggered clip can start before the trigger instant.

use crate::frame::Frame;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Bounded ring buffer of recent frames, evicted oldest-first.
///
/// Two bounds apply: the timestamp span between the oldest and newest frame
/// never exceeds `capacity`, and the frame count never exceeds `max_frames`.
pub struct PreEventCache {
    frames: VecDeque<Frame>,
    capacity: Duration,
    max_frames: usize,
    bytes: usize,
}

impl PreEventCache {
    pub fn new(capacity: Duration, max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        Self {
            frames: VecDeque::with_capacity(max_frames.min(4096)),
            capacity,
            max_frames,
            bytes: 0,
        }
    }

    /// Capacity for `capacity` seconds at `fps`, with one second of slack for jitter.
    pub fn for_rate(capacity: Duration, fps: u32) -> Self {
        let frames = (capacity.as_secs_f64() * fps as f64).ceil() as usize + fps as usize;
        Self::new(capacity, frames)
    }

    /// Push a frame, evicting whatever falls out of the window.
    pub fn push(&mut self, frame: Frame) {
        if let Some(newest) = self.frames.back() {
            if frame.pts < newest.pts {
                // Timestamps went backwards (source restart); old history no longer lines up.
                debug!(
                    previous_pts_ms = newest.pts.as_millis() as u64,
                    pts_ms = frame.pts.as_millis() as u64,
                    "Stream discontinuity, clearing pre-event cache"
                );
                self.clear();
            }
        }

        self.bytes += frame.payload.len();
        self.frames.push_back(frame);
        self.evict();
    }

    fn evict(&mut self) {
        while self.frames.len() > self.max_frames || self.span() > self.capacity {
            match self.frames.pop_front() {
                Some(old) => self.bytes = self.bytes.saturating_sub(old.payload.len()),
                None => break,
            }
        }
    }

    /// Frames for a clip triggered at `trigger` with `pre_roll` of history.
    ///
    /// Starts at the newest frame at or before `trigger - pre_roll` so the
    /// window is fully covered. With less history than requested, starts at
    /// the oldest cached frame. Includes every cached frame after the trigger.
    pub fn pre_roll_from(&self, trigger: Duration, pre_roll: Duration) -> Vec<Frame> {
        let window_start = trigger.saturating_sub(pre_roll);
        let start = self
            .frames
            .iter()
            .rposition(|f| f.pts <= window_start)
            .unwrap_or(0);

        self.frames.iter().skip(start).cloned().collect()
    }

    /// Timestamp of the newest cached frame.
    pub fn latest_pts(&self) -> Option<Duration> {
        self.frames.back().map(|f| f.pts)
    }

    /// Timestamp of the oldest cached frame.
    pub fn earliest_pts(&self) -> Option<Duration> {
        self.frames.front().map(|f| f.pts)
    }

    /// Dimensions of the newest cached frame.
    pub fn latest_dimensions(&self) -> Option<(u32, u32)> {
        self.frames.back().map(|f| (f.width, f.height))
    }

    /// Timestamp span of cached history.
    pub fn span(&self) -> Duration {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => last.pts.saturating_sub(first.pts),
            _ => Duration::ZERO,
        }
    }

    pub fn capacity(&self) -> Duration {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Payload bytes currently held.
    pub fn memory_bytes(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.bytes = 0;
    }
}
