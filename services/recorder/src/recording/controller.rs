//! Recording session controller.
//!
//! Owns the pre-event cache and the single active session. Frames from the
//! record branch enter through [`RecordingController::push_frame`]; start
//! requests arrive either directly through [`RecordingController::start_session`]
//! or, from the trigger probe, through the non-blocking command queue.
//!
//! ```text
//! Idle -> Pending -> Recording -> Finalizing -> Completed -> Idle
//! ```
//!
//! Clip attach runs on a blocking worker. Once attached, each session gets a
//! writer on the blocking pool that owns the clip and is fed through a queue,
//! so the state lock is never held across clip I/O. Completion events are
//! sent on an unbounded channel while the state lock is held, so consumers
//! see them in completion order.

use super::cache::PreEventCache;
use super::session::{
    clip_file_name, RecordingSession, SessionCompleted, SessionId, SessionState, StartRequest,
    StopStatus,
};
use super::sink::{ClipSink, ClipSummary, ClipTarget, ClipWriter, ContainerKind, SinkError};
use crate::config::RecorderConfig;
use crate::frame::Frame;
use chrono::Local;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {active} is already active")]
    AlreadyRecording { active: SessionId },

    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    #[error("Failed to attach clip writer: {0}")]
    AttachFailed(#[source] SinkError),

    #[error("Controller command queue is full")]
    QueueFull,

    #[error("Controller is shut down")]
    ControllerClosed,
}

/// Identifier of a queued start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Non-blocking start entry used by the trigger probe.
pub trait StartRequester: Send + Sync {
    /// Queue a start request without waiting for the session to attach.
    fn request_start(&self, request: StartRequest) -> Result<RequestId, SessionError>;

    /// Whether the request's lifecycle has ended (completed or failed to start).
    fn is_settled(&self, id: RequestId) -> bool;

    /// Whether a new session could start right now.
    fn is_idle(&self) -> bool;
}

/// Controller settings derived from the recorder configuration.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub cache_capacity: Duration,
    pub fps: u32,
    pub default_duration: Duration,
    pub output_dir: PathBuf,
    pub name_prefix: String,
    pub container: ContainerKind,
    pub annotations_visible: bool,
    pub watchdog_grace: Duration,
    pub finalize_timeout: Duration,
    pub command_queue_size: usize,
}

impl ControllerSettings {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            cache_capacity: config.recording.cache_capacity(),
            fps: config.source.fps,
            default_duration: config.recording.default_duration(),
            output_dir: config.recording.output_dir.clone(),
            name_prefix: config.recording.file_name_prefix().to_string(),
            container: config.recording.container,
            annotations_visible: config.recording.annotations_visible,
            watchdog_grace: config.recording.watchdog_grace(),
            finalize_timeout: config.recording.finalize_timeout(),
            command_queue_size: config.pipeline.command_queue_size,
        }
    }
}

/// Controller statistics.
#[derive(Debug, Clone, Default)]
pub struct ControllerStats {
    pub frames_cached: u64,
    pub frames_written: u64,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub attach_failures: u64,
    pub write_errors: u64,
    pub finalize_failures: u64,
    pub watchdog_stops: u64,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub state: SessionState,
    pub active: Option<SessionId>,
    pub cached_frames: usize,
    pub cached_span: Duration,
}

enum Command {
    Start {
        request_id: RequestId,
        request: StartRequest,
    },
}

struct Active {
    session: RecordingSession,
    /// Queue into the session's clip writer; dropped to finalize the clip
    frames: Option<mpsc::UnboundedSender<Frame>>,
    watchdog: Option<AbortHandle>,
    request: Option<RequestId>,
}

struct Core {
    cache: PreEventCache,
    active: Option<Active>,
    next_id: u32,
    stats: ControllerStats,
}

struct Shared {
    settings: ControllerSettings,
    sink: Arc<dyn ClipSink>,
    core: Mutex<Core>,
    events: Mutex<Option<mpsc::UnboundedSender<SessionCompleted>>>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    unsettled: Mutex<HashSet<RequestId>>,
    next_request: AtomicU64,
    state: watch::Sender<SessionState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

/// Outcome of queueing one frame for the active clip.
enum WriteOutcome {
    Written,
    /// Already in the clip from the pre-roll flush
    Skipped,
    DeadlineReached,
    /// The clip writer is gone
    Failed,
}

/// Handle to the recording session controller.
#[derive(Clone)]
pub struct RecordingController {
    shared: Arc<Shared>,
}

impl RecordingController {
    /// Create the controller and start its command worker.
    ///
    /// Must be called from within a tokio runtime. Returns the receiver of
    /// completion events.
    pub fn spawn(
        settings: ControllerSettings,
        sink: Arc<dyn ClipSink>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionCompleted>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, mut commands_rx) = mpsc::channel(settings.command_queue_size.max(1));
        let (state_tx, _) = watch::channel(SessionState::Idle);

        let cache = PreEventCache::for_rate(settings.cache_capacity, settings.fps);

        info!(
            sink = sink.name(),
            cache_secs = settings.cache_capacity.as_secs(),
            container = settings.container.extension(),
            output_dir = %settings.output_dir.display(),
            "Recording controller ready"
        );

        let controller = Self {
            shared: Arc::new(Shared {
                settings,
                sink,
                core: Mutex::new(Core {
                    cache,
                    active: None,
                    next_id: 0,
                    stats: ControllerStats::default(),
                }),
                events: Mutex::new(Some(events_tx)),
                commands: Mutex::new(Some(commands_tx)),
                unsettled: Mutex::new(HashSet::new()),
                next_request: AtomicU64::new(0),
                state: state_tx,
                worker: Mutex::new(None),
                runtime: Handle::current(),
            }),
        };

        let worker = controller.clone();
        let handle = tokio::spawn(async move {
            while let Some(command) = commands_rx.recv().await {
                match command {
                    Command::Start {
                        request_id,
                        request,
                    } => {
                        if let Err(e) = worker.start_with(request, Some(request_id)).await {
                            warn!(error = %e, "Triggered recording did not start");
                            worker.settle(request_id);
                        }
                    }
                }
            }
            debug!("Controller command worker stopped");
        });
        *controller.shared.worker.lock() = Some(handle);

        (controller, events_rx)
    }

    /// Start a session: attach a clip writer, flush pre-roll, begin recording.
    pub async fn start_session(&self, request: StartRequest) -> Result<SessionId, SessionError> {
        self.start_with(request, None).await
    }

    async fn start_with(
        &self,
        request: StartRequest,
        request_id: Option<RequestId>,
    ) -> Result<SessionId, SessionError> {
        let settings = &self.shared.settings;

        let (id, target) = {
            let mut core = self.shared.core.lock();
            if let Some(active) = &core.active {
                return Err(SessionError::AlreadyRecording {
                    active: active.session.id,
                });
            }

            let duration = if request.duration.is_zero() {
                settings.default_duration
            } else {
                request.duration
            };
            let trigger_pts = request
                .trigger_pts
                .or_else(|| core.cache.latest_pts())
                .unwrap_or_default();
            let (width, height) = core.cache.latest_dimensions().unwrap_or((0, 0));

            let id = SessionId(core.next_id);
            core.next_id += 1;

            let started_at = Local::now();
            let prefix = request
                .name_prefix
                .as_deref()
                .unwrap_or(&settings.name_prefix);
            let file_name = clip_file_name(prefix, id, &started_at, settings.container);

            let session = RecordingSession {
                id,
                state: SessionState::Pending,
                pre_roll: request.pre_roll,
                duration,
                trigger_pts,
                first_pts: None,
                last_pts: None,
                stop_pts: None,
                directory: settings.output_dir.clone(),
                file_name,
                width,
                height,
                annotations_visible: settings.annotations_visible,
                frames_written: 0,
                stop_requested: false,
                started_at,
            };

            let target = ClipTarget {
                path: session.path(),
                width,
                height,
                fps: settings.fps,
                container: settings.container,
            };

            core.active = Some(Active {
                session,
                frames: None,
                watchdog: None,
                request: request_id,
            });
            self.publish(SessionState::Pending);
            (id, target)
        };

        let sink = self.shared.sink.clone();
        let open_target = target.clone();
        let opened = self
            .shared
            .runtime
            .spawn_blocking(move || sink.open(&open_target))
            .await
            .map_err(|e| SinkError::Open(e.to_string()))
            .and_then(|result| result);

        let mut core = self.shared.core.lock();
        let writer = match opened {
            Ok(writer) => writer,
            Err(e) => {
                core.active.take();
                core.stats.attach_failures += 1;
                self.publish(SessionState::Idle);
                error!(
                    session_id = %id,
                    path = %target.path.display(),
                    error = %e,
                    "Failed to attach clip writer"
                );
                return Err(SessionError::AttachFailed(e));
            }
        };

        let Core {
            cache,
            active,
            stats,
            ..
        } = &mut *core;
        let Some(active) = active.as_mut() else {
            return Err(SessionError::ControllerClosed);
        };

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let controller = self.clone();
        self.shared
            .runtime
            .spawn_blocking(move || controller.run_writer(id, writer, frames_rx));
        active.frames = Some(frames_tx);
        active.session.state = SessionState::Recording;

        // Only queued here; the writer drains the pre-roll outside the lock.
        let pre_roll = cache.pre_roll_from(active.session.trigger_pts, active.session.pre_roll);
        let mut finish = false;
        for frame in &pre_roll {
            match write_frame(active, frame) {
                WriteOutcome::Written => stats.frames_written += 1,
                WriteOutcome::Skipped => {}
                WriteOutcome::DeadlineReached => {
                    finish = true;
                    break;
                }
                WriteOutcome::Failed => {
                    stats.write_errors += 1;
                    finish = true;
                    break;
                }
            }
        }
        stats.sessions_started += 1;

        info!(
            session_id = %id,
            file = %active.session.file_name,
            trigger_pts_ms = active.session.trigger_pts.as_millis() as u64,
            pre_roll_frames = active.session.frames_written,
            duration_ms = active.session.duration.as_millis() as u64,
            "Recording session started"
        );

        if finish || active.session.stop_requested {
            self.begin_finalize(&mut core);
        } else {
            let limit = active.session.duration + self.shared.settings.watchdog_grace;
            let controller = self.clone();
            let watchdog = self.shared.runtime.spawn(async move {
                tokio::time::sleep(limit).await;
                controller.expire(id);
            });
            active.watchdog = Some(watchdog.abort_handle());
            self.publish(SessionState::Recording);
        }

        Ok(id)
    }

    /// Stop a session early.
    pub fn stop_session(&self, id: SessionId) -> Result<StopStatus, SessionError> {
        let mut core = self.shared.core.lock();

        let active = core.active.as_ref().map(|a| (a.session.id, a.session.state));
        let state = match active {
            Some((active_id, state)) if active_id == id => state,
            _ if id.0 < core.next_id => return Ok(StopStatus::AlreadyCompleted),
            _ => return Err(SessionError::UnknownSession(id)),
        };

        match state {
            SessionState::Pending => {
                if let Some(active) = core.active.as_mut() {
                    active.session.stop_requested = true;
                }
                debug!(session_id = %id, "Stop requested while attaching");
                Ok(StopStatus::Stopping)
            }
            SessionState::Recording => {
                info!(session_id = %id, "Stopping recording session");
                self.begin_finalize(&mut core);
                Ok(StopStatus::Stopping)
            }
            SessionState::Finalizing => Ok(StopStatus::AlreadyFinalizing),
            SessionState::Completed | SessionState::Idle => Ok(StopStatus::AlreadyCompleted),
        }
    }

    /// Feed one record-branch frame: cache it, and queue it for the active clip.
    ///
    /// A timestamp that goes backwards means the source restarted; the active
    /// session ends at its last queued frame and the frame is not written.
    pub fn push_frame(&self, frame: Frame) {
        let mut core = self.shared.core.lock();
        core.stats.frames_cached += 1;

        let mut finish = false;
        let Core {
            cache,
            active,
            stats,
            ..
        } = &mut *core;
        let restarted = cache.latest_pts().is_some_and(|latest| frame.pts < latest);
        if let Some(active) = active.as_mut() {
            let open = matches!(
                active.session.state,
                SessionState::Pending | SessionState::Recording
            );
            if restarted && open {
                warn!(
                    session_id = %active.session.id,
                    pts_ms = frame.pts.as_millis() as u64,
                    "Stream discontinuity, ending active session"
                );
                if active.session.state == SessionState::Pending {
                    active.session.stop_requested = true;
                } else {
                    finish = true;
                }
            } else if !restarted && active.session.state == SessionState::Recording {
                match write_frame(active, &frame) {
                    WriteOutcome::Written => stats.frames_written += 1,
                    WriteOutcome::Skipped => {}
                    WriteOutcome::DeadlineReached => finish = true,
                    WriteOutcome::Failed => {
                        stats.write_errors += 1;
                        finish = true;
                    }
                }
            }
        }

        core.cache.push(frame);

        if finish {
            self.begin_finalize(&mut core);
        }
    }

    /// Called by the wall-clock watchdog when a session outlives its duration.
    fn expire(&self, id: SessionId) {
        let mut core = self.shared.core.lock();
        let stalled = matches!(
            core.active.as_ref(),
            Some(a) if a.session.id == id && a.session.state == SessionState::Recording
        );
        if stalled {
            warn!(session_id = %id, "No frames reached the session deadline, stopping on watchdog");
            core.stats.watchdog_stops += 1;
            self.begin_finalize(&mut core);
        }
    }

    /// Move the active session to Finalizing and close its writer off the runtime.
    ///
    /// Must be called with the core lock held.
    fn begin_finalize(&self, core: &mut Core) {
        let Some(active) = core.active.as_mut() else {
            return;
        };
        if active.session.state == SessionState::Finalizing {
            return;
        }
        if let Some(watchdog) = active.watchdog.take() {
            watchdog.abort();
        }

        let session = &mut active.session;
        session.state = SessionState::Finalizing;
        if session.stop_pts.is_none() {
            session.stop_pts = session.last_pts.or(Some(session.trigger_pts));
        }
        let id = session.id;
        self.publish(SessionState::Finalizing);

        match active.frames.take() {
            // Closing the queue lets the writer drain it and finalize.
            Some(queue) => drop(queue),
            None => {
                let controller = self.clone();
                self.shared.runtime.spawn(async move {
                    let missing = SinkError::Finalize("no clip writer attached".to_string());
                    controller.complete(id, Err(missing));
                });
            }
        }
    }

    /// Write queued frames into the clip until the queue closes, then finalize.
    ///
    /// Runs on the blocking pool for the life of the session.
    fn run_writer(
        &self,
        id: SessionId,
        mut writer: Box<dyn ClipWriter>,
        mut frames: mpsc::UnboundedReceiver<Frame>,
    ) {
        let mut failed = false;
        while let Some(frame) = frames.blocking_recv() {
            if failed {
                continue;
            }
            if let Err(e) = writer.write(&frame) {
                warn!(
                    session_id = %id,
                    pts_ms = frame.pts.as_millis() as u64,
                    error = %e,
                    "Clip write failed, finalizing early"
                );
                failed = true;
                self.write_failed(id);
            }
        }

        let result = writer.finalize();
        self.complete(id, result);
    }

    fn write_failed(&self, id: SessionId) {
        let mut core = self.shared.core.lock();
        core.stats.write_errors += 1;
        let recording = matches!(
            core.active.as_ref(),
            Some(a) if a.session.id == id && a.session.state == SessionState::Recording
        );
        if recording {
            self.begin_finalize(&mut core);
        }
    }

    fn complete(&self, id: SessionId, result: Result<ClipSummary, SinkError>) {
        let mut core = self.shared.core.lock();
        let Some(mut active) = core.active.take() else {
            return;
        };
        if active.session.id != id {
            core.active = Some(active);
            return;
        }

        match result {
            Ok(summary) => {
                active.session.state = SessionState::Completed;
                self.publish(SessionState::Completed);
                core.stats.sessions_completed += 1;

                let event = active.session.completed_event();
                info!(
                    session_id = %id,
                    file = %event.file_name,
                    duration_ms = event.duration_ms,
                    frames = summary.frames,
                    bytes = summary.bytes,
                    "Recording session completed"
                );

                if let Some(events) = self.shared.events.lock().as_ref() {
                    if events.send(event).is_err() {
                        warn!(session_id = %id, "Completion event dropped, no listener");
                    }
                }
            }
            Err(e) => {
                core.stats.finalize_failures += 1;
                error!(
                    session_id = %id,
                    path = %active.session.path().display(),
                    error = %e,
                    "Failed to finalize clip"
                );
            }
        }

        self.publish(SessionState::Idle);
        drop(core);

        if let Some(request) = active.request {
            self.settle(request);
        }
    }

    fn settle(&self, request: RequestId) {
        self.shared.unsettled.lock().remove(&request);
    }

    fn publish(&self, state: SessionState) {
        self.shared.state.send_replace(state);
    }

    /// Current state, active session and cache occupancy.
    pub fn status(&self) -> ControllerStatus {
        let core = self.shared.core.lock();
        ControllerStatus {
            state: core
                .active
                .as_ref()
                .map(|a| a.session.state)
                .unwrap_or(SessionState::Idle),
            active: core.active.as_ref().map(|a| a.session.id),
            cached_frames: core.cache.len(),
            cached_span: core.cache.span(),
        }
    }

    /// Get controller statistics.
    pub fn stats(&self) -> ControllerStats {
        self.shared.core.lock().stats.clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Stop accepting requests, finish any active session and close the event channel.
    pub async fn shutdown(&self) {
        self.shared.commands.lock().take();

        // Let already queued start requests run so their sessions are finished below.
        let worker = self.shared.worker.lock().take();
        if let Some(worker) = worker {
            if tokio::time::timeout(self.shared.settings.finalize_timeout, worker)
                .await
                .is_err()
            {
                warn!("Timed out waiting for queued start requests");
            }
        }

        let active = self.shared.core.lock().active.as_ref().map(|a| a.session.id);
        if let Some(id) = active {
            info!(session_id = %id, "Finishing active session before shutdown");
            if let Err(e) = self.stop_session(id) {
                warn!(session_id = %id, error = %e, "Failed to stop session");
            }

            let mut state = self.subscribe();
            let idle = state.wait_for(|s| *s == SessionState::Idle);
            let waited = tokio::time::timeout(self.shared.settings.finalize_timeout, idle).await;
            match waited {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => warn!("Controller state channel closed during shutdown"),
                Err(_) => warn!(
                    session_id = %id,
                    timeout_secs = self.shared.settings.finalize_timeout.as_secs(),
                    "Timed out waiting for session to finalize"
                ),
            }
        }

        self.shared.events.lock().take();
    }
}

impl StartRequester for RecordingController {
    fn request_start(&self, request: StartRequest) -> Result<RequestId, SessionError> {
        let commands = self.shared.commands.lock();
        let Some(commands) = commands.as_ref() else {
            return Err(SessionError::ControllerClosed);
        };

        let request_id = RequestId(self.shared.next_request.fetch_add(1, Ordering::Relaxed));
        self.shared.unsettled.lock().insert(request_id);

        match commands.try_send(Command::Start {
            request_id,
            request,
        }) {
            Ok(()) => Ok(request_id),
            Err(e) => {
                self.settle(request_id);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(SessionError::QueueFull),
                    mpsc::error::TrySendError::Closed(_) => Err(SessionError::ControllerClosed),
                }
            }
        }
    }

    fn is_settled(&self, id: RequestId) -> bool {
        !self.shared.unsettled.lock().contains(&id)
    }

    fn is_idle(&self) -> bool {
        // Published under the core lock alongside every change to the active session
        *self.shared.state.borrow() == SessionState::Idle
    }
}

/// Queue a frame for the active session's clip.
///
/// Frames at or past the deadline end the session without being written.
fn write_frame(active: &mut Active, frame: &Frame) -> WriteOutcome {
    let session = &mut active.session;
    if session.last_pts.is_some_and(|last| frame.pts <= last) {
        return WriteOutcome::Skipped;
    }
    if frame.pts >= session.deadline() {
        session.stop_pts = Some(session.deadline());
        return WriteOutcome::DeadlineReached;
    }

    let Some(queue) = active.frames.as_ref() else {
        return WriteOutcome::Skipped;
    };
    if queue.send(frame.clone()).is_err() {
        warn!(session_id = %session.id, "Clip writer stopped, finalizing early");
        return WriteOutcome::Failed;
    }

    if session.width == 0 || session.height == 0 {
        session.width = frame.width;
        session.height = frame.height;
    }
    session.note_written(frame.pts);
    WriteOutcome::Written
}
