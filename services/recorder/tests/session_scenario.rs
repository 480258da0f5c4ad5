//! End-to-end recording scenarios against real clip files and the session log.

use bytes::Bytes;
use eventcam_recorder::config::{RearmPolicy, RecorderConfig, ScriptedObject};
use eventcam_recorder::recording::{
    ControllerSettings, ContainerKind, RawClipSink, RecordingController, StartRequest,
    RAW_CLIP_MAGIC,
};
use eventcam_recorder::{Frame, ObjectClass, Pipeline, SessionEventLogger, Termination};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const FPS: u64 = 30;

fn frame(i: u64) -> Frame {
    Frame::new(
        0,
        i,
        Duration::from_nanos(i * 1_000_000_000 / FPS),
        4,
        2,
        Bytes::from_static(&[7u8; 24]),
    )
}

/// Frames of a raw clip as (relative pts in ns, first payload byte).
fn read_raw_frames(clip: &[u8], payload_len: usize) -> Vec<(u64, u8)> {
    let header = RAW_CLIP_MAGIC.len() + 12;
    clip[header..]
        .chunks(12 + payload_len)
        .map(|chunk| {
            let pts = u64::from_le_bytes(chunk[..8].try_into().unwrap());
            (pts, chunk[12])
        })
        .collect()
}

fn create_controller_settings(dir: &Path) -> ControllerSettings {
    ControllerSettings {
        cache_capacity: Duration::from_secs(15),
        fps: FPS as u32,
        default_duration: Duration::from_secs(10),
        output_dir: dir.join("clips"),
        name_prefix: "With_BBox".to_string(),
        container: ContainerKind::Raw,
        annotations_visible: true,
        watchdog_grace: Duration::from_secs(5),
        finalize_timeout: Duration::from_secs(5),
        command_queue_size: 4,
    }
}

fn read_log(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_triggered_session_writes_clip_and_log_line() {
    let dir = tempfile::tempdir().unwrap();
    let settings = create_controller_settings(dir.path());
    let (controller, events) = RecordingController::spawn(settings, Arc::new(RawClipSink));
    let logger = SessionEventLogger::new(dir.path().join("smart_record.log"));
    let logger_task = tokio::spawn(logger.clone().run(events));

    // 20 s of history, trigger on the last frame
    let trigger_index = 20 * FPS;
    for i in 0..=trigger_index {
        controller.push_frame(frame(i));
    }
    let id = controller
        .start_session(
            StartRequest::new(Duration::from_secs(2), Duration::from_secs(7))
                .with_trigger_pts(frame(trigger_index).pts),
        )
        .await
        .unwrap();
    for i in trigger_index + 1..trigger_index + 10 * FPS {
        controller.push_frame(frame(i));
    }

    controller.shutdown().await;
    assert_eq!(logger_task.await.unwrap(), 1);

    let lines = read_log(logger.path());
    assert_eq!(lines.len(), 1);
    let fields: Vec<&str> = lines[0].split(':').collect();
    assert_eq!(fields.len(), 6);
    assert_eq!(fields[0], id.to_string());
    assert_eq!(&fields[1..4], &["4", "2", "7000ms"]);
    assert_eq!(Path::new(fields[4]), dir.path().join("clips"));
    assert!(fields[5].starts_with("With_BBox_00000_"));

    let clip = std::fs::read(dir.path().join("clips").join(fields[5])).unwrap();
    assert_eq!(&clip[..RAW_CLIP_MAGIC.len()], RAW_CLIP_MAGIC);
    // 2 s of pre-roll plus 7 s of recording, 12 bytes of framing and 24 of payload each
    let header = RAW_CLIP_MAGIC.len() + 12;
    let frames = (clip.len() - header) / (12 + 24);
    assert_eq!((clip.len() - header) % (12 + 24), 0);
    assert!(frames as u64 >= 9 * FPS - 1 && frames as u64 <= 9 * FPS + 1);

    assert_eq!(controller.stats().sessions_completed, 1);
}

#[tokio::test]
async fn test_short_history_clip_starts_at_earliest_cached_frame() {
    let dir = tempfile::tempdir().unwrap();
    let settings = create_controller_settings(dir.path());
    let (controller, events) = RecordingController::spawn(settings, Arc::new(RawClipSink));
    let logger = SessionEventLogger::new(dir.path().join("smart_record.log"));
    let logger_task = tokio::spawn(logger.clone().run(events));

    // Payload bytes carry the frame index so the clip can be matched to the stream
    let indexed = |i: u64| {
        let mut f = frame(i);
        f.payload = Bytes::from(vec![i as u8; 24]);
        f
    };

    // Only 1 s of history against a 2 s pre-roll
    let trigger_index = FPS;
    for i in 0..=trigger_index {
        controller.push_frame(indexed(i));
    }
    controller
        .start_session(
            StartRequest::new(Duration::from_secs(2), Duration::from_secs(7))
                .with_trigger_pts(frame(trigger_index).pts),
        )
        .await
        .unwrap();
    for i in trigger_index + 1..trigger_index + 10 * FPS {
        controller.push_frame(indexed(i));
    }

    controller.shutdown().await;
    assert_eq!(logger_task.await.unwrap(), 1);

    let lines = read_log(logger.path());
    assert_eq!(lines.len(), 1);
    let fields: Vec<&str> = lines[0].split(':').collect();
    assert_eq!(&fields[1..4], &["4", "2", "7000ms"]);

    let clip = std::fs::read(dir.path().join("clips").join(fields[5])).unwrap();
    let frames = read_raw_frames(&clip, 24);
    // Earliest cached frame through the last frame before the 8 s deadline
    assert_eq!(frames.len() as u64, 8 * FPS);
    assert_eq!(frames[0], (0, 0));
    let last = frames[frames.len() - 1];
    assert_eq!(last.0, frame(8 * FPS - 1).pts.as_nanos() as u64);
    assert_eq!(last.1, (8 * FPS - 1) as u8);
}

fn create_pipeline_config(dir: &Path, rearm: RearmPolicy) -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.source.width = 16;
    config.source.height = 8;
    config.source.fps = 10;
    config.source.realtime = false;
    config.source.stop_after_secs = Some(35);
    config.batching.width = 16;
    config.batching.height = 8;
    // 20 s of history before the person shows up
    config.inference.script = vec![ScriptedObject {
        class: ObjectClass::Person,
        start_secs: 20.0,
        end_secs: 23.0,
        count: 1,
        confidence: 0.9,
    }];
    config.trigger.rearm = rearm;
    config.recording.output_dir = dir.join("clips");
    config.event_log.path = dir.join("smart_record.log");
    config.pipeline.integrated_display = Some(false);
    // Deep enough that nothing is dropped while running unpaced
    config.pipeline.queue_size = 512;
    config.pipeline.live_queue_size = 512;
    config.pipeline.record_queue_size = 512;
    config
}

#[tokio::test]
async fn test_pipeline_records_one_session_per_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_pipeline_config(dir.path(), RearmPolicy::Never);
    let log_path = config.event_log.path.clone();

    let pipeline = Pipeline::new(config).unwrap();
    let summary = pipeline
        .run(std::future::pending::<()>())
        .await
        .unwrap();

    assert_eq!(summary.termination, Termination::EndOfStream);
    assert_eq!(summary.source.frames_produced, 350);
    assert_eq!(summary.probe.frames_seen, 350);
    assert_eq!(summary.probe.triggers_fired, 1);
    assert_eq!(summary.sessions_logged, 1);

    let lines = read_log(&log_path);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("0:16:8:7000ms:"));
    assert!(lines[0].contains(":With_BBox_00000_"));
}

#[tokio::test]
async fn test_pipeline_without_annotations_names_clips_accordingly() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = create_pipeline_config(dir.path(), RearmPolicy::Never);
    config.recording.annotations_visible = false;
    let log_path = config.event_log.path.clone();

    Pipeline::new(config)
        .unwrap()
        .run(std::future::pending::<()>())
        .await
        .unwrap();

    let lines = read_log(&log_path);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains(":Without_BBox_00000_"));
}

#[tokio::test]
async fn test_pipeline_shutdown_signal_stops_live_stream() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = create_pipeline_config(dir.path(), RearmPolicy::AfterSession);
    config.source.realtime = true;
    config.source.stop_after_secs = None;
    config.inference.script.clear();

    let summary = Pipeline::new(config)
        .unwrap()
        .run(tokio::time::sleep(Duration::from_millis(300)))
        .await
        .unwrap();

    assert_eq!(summary.termination, Termination::Shutdown);
    assert_eq!(summary.probe.triggers_fired, 0);
    assert_eq!(summary.sessions_logged, 0);
    assert!(!dir.path().join("smart_record.log").exists());
}
