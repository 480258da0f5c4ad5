//! Stage graph wiring.
//!
//! ```text
//! Source -> Batcher -> Inference -> TriggerProbe -> Overlay -> Splitter
//!                                                              |-> [DisplayTransform] -> LiveDisplay
//!                                                              '-> RecordBranch -> RecordingController
//!                                                                                        '-> SessionEventLogger
//! ```
//!
//! The stage list is planned once from the platform capabilities and never
//! changes afterwards.

use crate::batcher::{Batch, Batcher, BatcherStats};
use crate::config::RecorderConfig;
use crate::display::{
    DisplayStats, DisplayTransform, LiveSink, MetadataRenderer, OverlayRenderer, StatsDisplaySink,
};
use crate::event_log::SessionEventLogger;
use crate::frame::Frame;
use crate::inference::{self, Detector, InferenceError};
use crate::probe::{ProbeStats, TriggerProbe};
use crate::recording::{
    sink_for, ClipSink, ControllerSettings, ControllerStats, RecordingController, SinkError,
    StartRequester,
};
use crate::source::{self, FrameSource, SourceError, SourceStats};
use crate::splitter::{BranchSplitter, BranchStats, SplitterError};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Marker file present on integrated (Jetson-class) devices.
const INTEGRATED_PLATFORM_MARKER: &str = "/etc/nv_tegra_release";

const LIVE_BRANCH: &str = "live";
const RECORD_BRANCH: &str = "record";

/// Errors raised while building or running the graph.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Media error in {stage}: {message}")]
    Media { stage: Stage, message: String },

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Clip sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Detector error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Branch error: {0}")]
    Branch(#[from] SplitterError),

    #[error("Stage task failed: {0}")]
    Task(String),
}

/// One stage of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Source,
    Batcher,
    Inference,
    TriggerProbe,
    Overlay,
    Splitter,
    DisplayTransform,
    LiveDisplay,
    RecordBranch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Source => "source",
            Stage::Batcher => "batcher",
            Stage::Inference => "inference",
            Stage::TriggerProbe => "trigger-probe",
            Stage::Overlay => "overlay",
            Stage::Splitter => "splitter",
            Stage::DisplayTransform => "display-transform",
            Stage::LiveDisplay => "live-display",
            Stage::RecordBranch => "record-branch",
        };
        f.write_str(name)
    }
}

/// What the host platform provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformCapabilities {
    pub integrated_display: bool,
}

impl PlatformCapabilities {
    /// Query the host once. `forced` overrides detection.
    pub fn detect(forced: Option<bool>) -> Self {
        let integrated_display =
            forced.unwrap_or_else(|| Path::new(INTEGRATED_PLATFORM_MARKER).exists());
        Self { integrated_display }
    }
}

/// Fixed stage plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    stages: Vec<Stage>,
}

impl Topology {
    pub fn plan(capabilities: &PlatformCapabilities) -> Self {
        let mut stages = vec![
            Stage::Source,
            Stage::Batcher,
            Stage::Inference,
            Stage::TriggerProbe,
            Stage::Overlay,
            Stage::Splitter,
        ];
        if capabilities.integrated_display {
            stages.push(Stage::DisplayTransform);
        }
        stages.push(Stage::LiveDisplay);
        stages.push(Stage::RecordBranch);
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", stage)?;
        }
        Ok(())
    }
}

/// Why the graph stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The source ran out of frames
    EndOfStream,
    /// The shutdown signal fired
    Shutdown,
}

/// Final counters of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub termination: Termination,
    pub source: SourceStats,
    pub batcher: BatcherStats,
    pub probe: ProbeStats,
    pub branches: Vec<(String, BranchStats)>,
    pub display: DisplayStats,
    pub controller: ControllerStats,
    pub sessions_logged: u64,
}

/// The assembled recorder graph.
pub struct Pipeline {
    config: RecorderConfig,
    topology: Topology,
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    sink: Arc<dyn ClipSink>,
}

impl Pipeline {
    /// Build the graph from configuration.
    pub fn new(config: RecorderConfig) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;

        let capabilities = PlatformCapabilities::detect(config.pipeline.integrated_display);
        let source = source::source_for(&config.source)?;
        let detector = inference::detector_for(&config.inference)?;
        let sink = sink_for(config.recording.container)?;

        Ok(Self {
            topology: Topology::plan(&capabilities),
            config,
            source,
            detector,
            sink,
        })
    }

    /// Replace the clip sink.
    pub fn with_sink(mut self, sink: Arc<dyn ClipSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the frame source.
    pub fn with_source(mut self, source: Box<dyn FrameSource>) -> Self {
        self.source = source;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Run until end of stream or until `shutdown` resolves, then drain every
    /// stage and finalize any active session.
    pub async fn run<F>(self, shutdown: F) -> Result<RunSummary, PipelineError>
    where
        F: Future<Output = ()>,
    {
        let Pipeline {
            config,
            topology,
            mut source,
            mut detector,
            sink,
        } = self;

        info!(topology = %topology, "Stage plan");
        if !config.pre_roll_fits_cache() {
            warn!(
                pre_roll_secs = config.trigger.pre_roll_secs,
                cache_secs = config.recording.cache_secs,
                "Pre-roll exceeds the cache capacity and will be truncated"
            );
        }

        let (controller, events) =
            RecordingController::spawn(ControllerSettings::from_config(&config), sink);
        let logger = SessionEventLogger::new(config.event_log.path.clone());
        let logger_handle = tokio::spawn(logger.run(events));

        let splitter = BranchSplitter::new();
        let live_rx = splitter.attach(LIVE_BRANCH, config.pipeline.live_queue_size)?;
        let record_rx = splitter.attach(RECORD_BRANCH, config.pipeline.record_queue_size)?;

        let raw_rx = match source.start(config.pipeline.queue_size).await {
            Ok(rx) => rx,
            Err(e) => {
                controller.shutdown().await;
                return Err(e.into());
            }
        };
        info!(source = source.name(), "Source started");

        // Batch formation
        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(config.pipeline.queue_size);
        let batcher = Batcher::new(config.batching.clone());
        let batcher_stats = batcher.stats_handle();
        let batcher_handle = tokio::spawn(batcher.run(raw_rx, batch_tx));

        // Inference, probe, overlay, split
        let mut probe = TriggerProbe::new(
            &config.trigger,
            Arc::new(controller.clone()) as Arc<dyn StartRequester>,
        );
        let mut inference_handle = tokio::spawn({
            let splitter = splitter.clone();
            async move {
                run_inference(batch_rx, detector.as_mut(), &mut probe, &splitter).await;
                probe.stats()
            }
        });

        let live_handle = tokio::spawn(run_live(
            live_rx,
            topology
                .contains(Stage::DisplayTransform)
                .then(DisplayTransform::new),
        ));

        let record_handle = tokio::spawn({
            let controller = controller.clone();
            let annotations_visible = config.recording.annotations_visible;
            async move {
                let mut record_rx = record_rx;
                while let Some(mut frame) = record_rx.recv().await {
                    if !annotations_visible {
                        frame.strip_annotations();
                    }
                    controller.push_frame(frame);
                }
                info!("Record branch drained");
            }
        });

        tokio::pin!(shutdown);
        let mut probe_stats = None;
        let termination = tokio::select! {
            _ = &mut shutdown => {
                info!("Initiating graceful shutdown...");
                Termination::Shutdown
            }
            result = &mut inference_handle => {
                probe_stats = Some(result.map_err(|e| PipelineError::Task(e.to_string()))?);
                info!("End of stream");
                Termination::EndOfStream
            }
        };

        // Upstream first so every queue drains before the controller stops.
        source.stop().await;
        if probe_stats.is_none() {
            probe_stats = Some(
                inference_handle
                    .await
                    .map_err(|e| PipelineError::Task(e.to_string()))?,
            );
        }
        splitter.close();

        let (_, display, _) = futures::try_join!(batcher_handle, live_handle, record_handle)
            .map_err(|e| PipelineError::Task(e.to_string()))?;

        controller.shutdown().await;
        let sessions_logged = logger_handle
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?;

        let summary = RunSummary {
            termination,
            source: source.stats(),
            batcher: batcher_stats.read().clone(),
            probe: probe_stats.unwrap_or_default(),
            branches: splitter.stats(),
            display,
            controller: controller.stats(),
            sessions_logged,
        };
        log_final_stats(&summary);

        if let Some(message) = source.last_error() {
            error!(error = %message, "Source failed");
            return Err(PipelineError::Media {
                stage: Stage::Source,
                message,
            });
        }

        Ok(summary)
    }
}

async fn run_inference(
    mut batches: mpsc::Receiver<Batch>,
    detector: &mut dyn Detector,
    probe: &mut TriggerProbe,
    splitter: &BranchSplitter,
) {
    let mut renderer = MetadataRenderer::new();
    info!(detector = detector.name(), renderer = renderer.name(), "Inference started");

    while let Some(batch) = batches.recv().await {
        for mut frame in batch.frames {
            inference::annotate(detector, &mut frame);
            probe.process(&mut frame);
            renderer.render(&mut frame);
            splitter.deliver(frame);
        }
    }

    let (rendered, skipped) = renderer.counts();
    info!(rendered, skipped, "Inference drained");
}

async fn run_live(
    mut frames: mpsc::Receiver<Frame>,
    mut transform: Option<DisplayTransform>,
) -> DisplayStats {
    let mut sink = StatsDisplaySink::default();
    info!(
        display = sink.name(),
        transform = transform.is_some(),
        "Live display started"
    );

    while let Some(frame) = frames.recv().await {
        let frame = match transform.as_mut() {
            Some(transform) => transform.apply(frame),
            None => frame,
        };
        sink.show(&frame);
    }

    sink.stats()
}

/// Log final statistics on shutdown.
fn log_final_stats(summary: &RunSummary) {
    info!("=== Final Statistics ===");

    info!(
        termination = ?summary.termination,
        frames_produced = summary.source.frames_produced,
        frames_dropped = summary.source.frames_dropped,
        reconnect_count = summary.source.reconnect_count,
        "Source final stats"
    );

    let batcher = &summary.batcher;
    let avg_scale_time_us = if batcher.frames_rescaled > 0 {
        batcher.total_scale_time_us / batcher.frames_rescaled
    } else {
        0
    };
    info!(
        frames_batched = batcher.frames_batched,
        frames_rescaled = batcher.frames_rescaled,
        batches_full = batcher.batches_full,
        batches_timed_out = batcher.batches_timed_out,
        avg_scale_time_us,
        "Batcher final stats"
    );

    info!(
        frames_seen = summary.probe.frames_seen,
        malformed_frames = summary.probe.malformed_frames,
        triggers_fired = summary.probe.triggers_fired,
        requests_rejected = summary.probe.requests_rejected,
        "Probe final stats"
    );

    for (branch, stats) in &summary.branches {
        info!(
            branch = %branch,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "Branch final stats"
        );
    }

    info!(
        frames_shown = summary.display.frames_shown,
        "Live display final stats"
    );

    let controller = &summary.controller;
    info!(
        frames_cached = controller.frames_cached,
        frames_written = controller.frames_written,
        sessions_started = controller.sessions_started,
        sessions_completed = controller.sessions_completed,
        attach_failures = controller.attach_failures,
        finalize_failures = controller.finalize_failures,
        watchdog_stops = controller.watchdog_stops,
        sessions_logged = summary.sessions_logged,
        "Recording final stats"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_without_integrated_display() {
        let topology = Topology::plan(&PlatformCapabilities::default());
        assert!(!topology.contains(Stage::DisplayTransform));
        assert_eq!(topology.stages().first(), Some(&Stage::Source));
        assert!(topology.contains(Stage::RecordBranch));
    }

    #[test]
    fn test_topology_with_integrated_display() {
        let topology = Topology::plan(&PlatformCapabilities {
            integrated_display: true,
        });
        let stages = topology.stages();
        let transform = stages
            .iter()
            .position(|s| *s == Stage::DisplayTransform)
            .unwrap();
        let live = stages.iter().position(|s| *s == Stage::LiveDisplay).unwrap();
        assert_eq!(transform + 1, live);
        assert!(topology.to_string().contains("display-transform -> live-display"));
    }

    #[test]
    fn test_forced_capabilities() {
        assert!(PlatformCapabilities::detect(Some(true)).integrated_display);
        assert!(!PlatformCapabilities::detect(Some(false)).integrated_display);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RecorderConfig::default();
        config.trigger.classes.clear();
        assert!(matches!(
            Pipeline::new(config),
            Err(PipelineError::Configuration(_))
        ));
    }
}
