//! GStreamer camera capture with reconnection on startup.
//!
//! Accepts either an `rtsp://` URL or a GStreamer source description
//! (e.g. `v4l2src device=/dev/video0`) and normalizes it to packed RGB at the
//! configured resolution and rate.

use super::{FrameSource, SourceError, SourceStats};
use crate::config::SourceConfig;
use crate::frame::Frame;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capture source backed by a GStreamer pipeline ending in an appsink.
pub struct GstCameraSource {
    config: SourceConfig,
    pipeline: Arc<Mutex<Option<gst::Pipeline>>>,
    running: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    stats: Arc<RwLock<SourceStats>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl GstCameraSource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        gst::init().map_err(|e| SourceError::GstreamerInit(e.to_string()))?;

        Ok(Self {
            config,
            pipeline: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(0)),
            stats: Arc::new(RwLock::new(SourceStats::default())),
            last_error: Arc::new(Mutex::new(None)),
        })
    }

    fn build_pipeline_string(&self) -> String {
        let uri = self.config.uri.as_deref().unwrap_or_default();
        let source = if uri.starts_with("rtsp://") {
            format!(
                "rtspsrc location={} protocols=4 latency=200 ! rtph264depay ! h264parse ! avdec_h264",
                uri
            )
        } else {
            uri.to_string()
        };

        format!(
            "{source} ! videoconvert ! videoscale ! videorate \
             ! video/x-raw,format=RGB,width={width},height={height},framerate={fps}/1 \
             ! appsink name=sink emit-signals=true sync=false max-buffers=2 drop=true",
            source = source,
            width = self.config.width,
            height = self.config.height,
            fps = self.config.fps,
        )
    }

    async fn connect_with_retry(&self, tx: &mpsc::Sender<Frame>) -> Result<gst::Pipeline, SourceError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.reconnect_base_delay(),
            max_interval: self.config.reconnect_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;
        let max_attempts = self.config.max_reconnect_attempts;

        loop {
            match self.create_and_start_pipeline(tx.clone()) {
                Ok(pipeline) => {
                    info!(
                        source = self.config.uri.as_deref().unwrap_or_default(),
                        attempts,
                        "Camera stream connected"
                    );
                    return Ok(pipeline);
                }
                Err(e) => {
                    attempts += 1;
                    self.stats.write().reconnect_count = attempts;

                    if max_attempts > 0 && attempts >= max_attempts {
                        error!(attempts, error = %e, "Max reconnection attempts exceeded");
                        return Err(SourceError::MaxReconnectAttemptsExceeded);
                    }

                    if let Some(delay) = backoff.next_backoff() {
                        warn!(
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Camera connection failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        backoff.reset();
                    }
                }
            }
        }
    }

    fn create_and_start_pipeline(&self, tx: mpsc::Sender<Frame>) -> Result<gst::Pipeline, SourceError> {
        let pipeline_str = self.build_pipeline_string();
        debug!(pipeline = %pipeline_str, "Creating capture pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| SourceError::PipelineCreation(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SourceError::PipelineCreation("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| SourceError::PipelineCreation("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| SourceError::PipelineCreation("Could not cast to AppSink".to_string()))?;

        self.configure_appsink(&appsink, tx);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| SourceError::ConnectionFailed(e.to_string()))?;

        let (result, _state, _pending) = pipeline.state(gst::ClockTime::from_seconds(
            self.config.connection_timeout_secs,
        ));
        if result.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(SourceError::ConnectionFailed(
                "Timeout waiting for pipeline to start".to_string(),
            ));
        }

        self.stats.write().stream_start = Some(Instant::now());
        Ok(pipeline)
    }

    fn configure_appsink(&self, appsink: &gst_app::AppSink, sender: mpsc::Sender<Frame>) {
        let sequence = self.sequence.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let source_id = self.config.source_id;
        let fps = self.config.fps.max(1) as u64;

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    if !running.load(Ordering::SeqCst) {
                        return Err(gst::FlowError::Eos);
                    }

                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;

                    let structure = caps.structure(0).ok_or(gst::FlowError::Error)?;
                    let width: i32 = structure.get("width").map_err(|_| gst::FlowError::Error)?;
                    let height: i32 = structure.get("height").map_err(|_| gst::FlowError::Error)?;

                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let payload = Bytes::copy_from_slice(map.as_slice());

                    let seq = sequence.fetch_add(1, Ordering::SeqCst);
                    let pts = buffer
                        .pts()
                        .map(|t| Duration::from_nanos(t.nseconds()))
                        .unwrap_or_else(|| Duration::from_nanos(seq * 1_000_000_000 / fps));

                    let frame = Frame::new(source_id, seq, pts, width as u32, height as u32, payload);
                    let bytes = frame.payload.len();

                    match sender.try_send(frame) {
                        Ok(()) => {
                            stats.write().record(bytes);
                            Ok(gst::FlowSuccess::Ok)
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            stats.write().frames_dropped += 1;
                            debug!(sequence = seq, "Frame dropped due to backpressure");
                            Ok(gst::FlowSuccess::Ok)
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => Err(gst::FlowError::Eos),
                    }
                })
                .build(),
        );
    }

    /// Watch the bus; tear the pipeline down on error or end of stream so the
    /// frame channel closes.
    fn spawn_bus_monitor(&self, pipeline: gst::Pipeline) {
        let Some(bus) = pipeline.bus() else {
            return;
        };
        let slot = self.pipeline.clone();
        let running = self.running.clone();
        let last_error = self.last_error.clone();

        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                if let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) {
                    match msg.view() {
                        gst::MessageView::Error(err) => {
                            error!(
                                error = %err.error(),
                                debug = ?err.debug(),
                                "Capture pipeline error"
                            );
                            *last_error.lock() = Some(err.error().to_string());
                            break;
                        }
                        gst::MessageView::Eos(_) => {
                            info!("Camera end of stream");
                            break;
                        }
                        gst::MessageView::Warning(w) => {
                            warn!(warning = %w.error(), "Capture pipeline warning");
                        }
                        _ => {}
                    }
                }

                tokio::task::yield_now().await;
            }

            running.store(false, Ordering::SeqCst);
            if let Some(pipeline) = slot.lock().take() {
                let _ = pipeline.set_state(gst::State::Null);
            }
        });
    }
}

#[async_trait]
impl FrameSource for GstCameraSource {
    fn name(&self) -> &'static str {
        "camera"
    }

    async fn start(&mut self, capacity: usize) -> Result<mpsc::Receiver<Frame>, SourceError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SourceError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pipeline = match self.connect_with_retry(&tx).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        *self.pipeline.lock() = Some(pipeline.clone());
        self.spawn_bus_monitor(pipeline);
        Ok(rx)
    }

    async fn stop(&mut self) {
        info!("Stopping camera source");
        self.running.store(false, Ordering::SeqCst);
        if let Some(pipeline) = self.pipeline.lock().take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }

    fn stats(&self) -> SourceStats {
        self.stats.read().clone()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Drop for GstCameraSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(pipeline) = self.pipeline.lock().take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}
