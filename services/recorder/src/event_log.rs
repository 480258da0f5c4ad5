//! Session event logger.
//!
//! Appends one line per completed session to an append-only text log:
//!
//! ```text
//! {session_id}:{width}:{height}:{duration_ms}ms:{directory}:{file_name}
//! ```

use crate::recording::SessionCompleted;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Errors raised while appending to the session log.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Failed to write session log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Log writer task failed: {0}")]
    Task(String),
}

/// Format one log line, including the trailing newline.
pub fn format_line(event: &SessionCompleted) -> String {
    format!(
        "{}:{}:{}:{}ms:{}:{}\n",
        event.session_id,
        event.width,
        event.height,
        event.duration_ms,
        event.directory.display(),
        event.file_name
    )
}

/// Appends completed-session summaries to a log file.
#[derive(Clone)]
pub struct SessionEventLogger {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl SessionEventLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Each line goes out in a single write on an append handle.
    pub fn append(&self, event: &SessionCompleted) -> Result<(), EventLogError> {
        let line = format_line(event);
        let io_err = |source| EventLogError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;

        debug!(session_id = %event.session_id, path = %self.path.display(), "Session logged");
        Ok(())
    }

    /// Consume completion events until the channel closes. Failures are
    /// logged and never stop the loop.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<SessionCompleted>) -> u64 {
        info!(path = %self.path.display(), "Session event logger started");
        let mut written = 0u64;

        while let Some(event) = events.recv().await {
            let logger = self.clone();
            let session_id = event.session_id;
            let result = tokio::task::spawn_blocking(move || logger.append(&event))
                .await
                .map_err(|e| EventLogError::Task(e.to_string()))
                .and_then(|r| r);

            match result {
                Ok(()) => written += 1,
                Err(e) => error!(session_id = %session_id, error = %e, "Failed to log session"),
            }
        }

        info!(sessions = written, "Session event logger stopped");
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::SessionId;

    fn event(id: u32, duration_ms: u64) -> SessionCompleted {
        SessionCompleted {
            session_id: SessionId(id),
            width: 1920,
            height: 1080,
            duration_ms,
            directory: PathBuf::from("/data/clips"),
            file_name: format!("With_BBox_{:05}_20240101-120000.mp4", id),
        }
    }

    #[test]
    fn test_line_format() {
        assert_eq!(
            format_line(&event(0, 7000)),
            "0:1920:1080:7000ms:/data/clips:With_BBox_00000_20240101-120000.mp4\n"
        );
    }

    #[test]
    fn test_append_creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionEventLogger::new(dir.path().join("smart_record.log"));

        logger.append(&event(0, 7000)).unwrap();
        logger.append(&event(1, 6990)).unwrap();

        let contents = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0:1920:1080:7000ms:"));
        assert!(lines[1].starts_with("1:1920:1080:6990ms:"));
    }

    #[test]
    fn test_unwritable_path_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionEventLogger::new(dir.path().join("missing").join("log"));
        assert!(matches!(
            logger.append(&event(0, 1)),
            Err(EventLogError::Io { .. })
        ));
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionEventLogger::new(dir.path().join("log"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let logger = logger.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        logger.append(&event(i * 100 + j, 7000)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = std::fs::read_to_string(logger.path()).unwrap();
        assert_eq!(contents.lines().count(), 200);
        assert!(contents
            .lines()
            .all(|l| l.split(':').count() == 6 && l.ends_with(".mp4")));
    }

    #[tokio::test]
    async fn test_run_preserves_completion_order() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionEventLogger::new(dir.path().join("log"));
        let (tx, rx) = mpsc::unbounded_channel();

        for i in 0..5 {
            tx.send(event(i, 1000 + i as u64)).unwrap();
        }
        drop(tx);

        let written = logger.clone().run(rx).await;
        assert_eq!(written, 5);

        let contents = std::fs::read_to_string(logger.path()).unwrap();
        let ids: Vec<_> = contents
            .lines()
            .map(|l| l.split(':').next().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4"]);
    }
}
