//! Recording session state and the completion event it produces.

use chrono::{DateTime, Local};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::sink::ContainerKind;

/// Identifier of one recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a session.
///
/// `Idle -> Pending -> Recording -> Finalizing -> Completed -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Clip writer is being attached
    Pending,
    Recording,
    /// Clip writer is flushing and closing the output
    Finalizing,
    Completed,
}

/// Parameters of a start request.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    /// History to prepend from the pre-event cache
    pub pre_roll: Duration,

    /// Recording length after the trigger; zero selects the configured default
    pub duration: Duration,

    /// File name prefix overriding the configured one
    pub name_prefix: Option<String>,

    /// Stream time of the triggering frame; the newest cached frame when unset
    pub trigger_pts: Option<Duration>,
}

impl StartRequest {
    pub fn new(pre_roll: Duration, duration: Duration) -> Self {
        Self {
            pre_roll,
            duration,
            name_prefix: None,
            trigger_pts: None,
        }
    }

    pub fn with_trigger_pts(mut self, pts: Duration) -> Self {
        self.trigger_pts = Some(pts);
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }
}

/// Result of a stop request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// The session will finalize
    Stopping,
    AlreadyFinalizing,
    AlreadyCompleted,
}

/// One bounded recording operation.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub id: SessionId,
    pub state: SessionState,
    pub pre_roll: Duration,
    pub duration: Duration,

    /// Stream time the session was triggered at
    pub trigger_pts: Duration,

    /// Timestamp of the first frame written to the clip
    pub first_pts: Option<Duration>,

    /// Timestamp of the newest frame written to the clip
    pub last_pts: Option<Duration>,

    /// Stream time recording stopped at
    pub stop_pts: Option<Duration>,

    pub directory: PathBuf,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    pub annotations_visible: bool,
    pub frames_written: u64,

    /// A stop arrived while the writer was still attaching
    pub stop_requested: bool,

    pub started_at: DateTime<Local>,
}

impl RecordingSession {
    /// Stream time at which the session has recorded its full duration.
    pub fn deadline(&self) -> Duration {
        self.trigger_pts + self.duration
    }

    /// Record a frame written to the clip.
    pub fn note_written(&mut self, pts: Duration) {
        if self.first_pts.is_none() {
            self.first_pts = Some(pts);
        }
        self.last_pts = Some(pts);
        self.frames_written += 1;
    }

    /// Recorded time from the trigger to the stop, in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        let stop = self.stop_pts.or(self.last_pts).unwrap_or(self.trigger_pts);
        stop.saturating_sub(self.trigger_pts).as_millis() as u64
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    pub fn completed_event(&self) -> SessionCompleted {
        SessionCompleted {
            session_id: self.id,
            width: self.width,
            height: self.height,
            duration_ms: self.duration_ms(),
            directory: self.directory.clone(),
            file_name: self.file_name.clone(),
        }
    }
}

/// Emitted once for every session that reaches `Completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCompleted {
    pub session_id: SessionId,
    pub width: u32,
    pub height: u32,
    pub duration_ms: u64,
    pub directory: PathBuf,
    pub file_name: String,
}

/// Clip file name: `{prefix}_{id:05}_{YYYYMMDD-HHMMSS}.{ext}`.
pub fn clip_file_name(
    prefix: &str,
    id: SessionId,
    started_at: &DateTime<Local>,
    container: ContainerKind,
) -> String {
    format!(
        "{}_{:05}_{}.{}",
        prefix,
        id.0,
        started_at.format("%Y%m%d-%H%M%S"),
        container.extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session() -> RecordingSession {
        RecordingSession {
            id: SessionId(3),
            state: SessionState::Recording,
            pre_roll: Duration::from_secs(2),
            duration: Duration::from_secs(7),
            trigger_pts: Duration::from_secs(5),
            first_pts: None,
            last_pts: None,
            stop_pts: None,
            directory: PathBuf::from("/tmp/clips"),
            file_name: "With_BBox_00003_20240101-120000.rawv".to_string(),
            width: 1920,
            height: 1080,
            annotations_visible: true,
            frames_written: 0,
            stop_requested: false,
            started_at: Local::now(),
        }
    }

    #[test]
    fn test_deadline_and_duration() {
        let mut s = session();
        assert_eq!(s.deadline(), Duration::from_secs(12));

        s.note_written(Duration::from_secs(3));
        s.note_written(Duration::from_secs(12));
        s.stop_pts = Some(Duration::from_secs(12));

        assert_eq!(s.first_pts, Some(Duration::from_secs(3)));
        assert_eq!(s.frames_written, 2);
        assert_eq!(s.duration_ms(), 7000);
    }

    #[test]
    fn test_completed_event() {
        let mut s = session();
        s.stop_pts = Some(Duration::from_millis(8500));
        let event = s.completed_event();
        assert_eq!(event.session_id, SessionId(3));
        assert_eq!(event.duration_ms, 3500);
        assert_eq!(event.width, 1920);
        assert_eq!(s.path(), PathBuf::from("/tmp/clips/With_BBox_00003_20240101-120000.rawv"));
    }

    #[test]
    fn test_clip_file_name() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let name = clip_file_name("Without_BBox", SessionId(12), &at, ContainerKind::Mp4);
        assert_eq!(name, "Without_BBox_00012_20240309-070501.mp4");
    }
}
