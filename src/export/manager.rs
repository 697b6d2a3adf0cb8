//! Stream manager
//!
//! Owns the single active [`StreamingSession`] of a server instance. The
//! session slot sits behind one async mutex; a new session is only started
//! after the previous one has been drained, so at most one encoder ever has
//! an open input.

use crate::export::binary::EncoderBinary;
use crate::export::options::ExportOptions;
use crate::export::process::EncoderTracker;
use crate::export::session::{SessionSummary, StreamingSession};
use crate::export::types::{ExportError, ExportEvent, SessionState};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard};

/// Request to open a new streaming session
#[derive(Debug, Clone)]
pub struct StreamStart {
    pub options: ExportOptions,
    /// Fully resolved output file
    pub output: PathBuf,
}

/// Status of the manager for polling clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub state: SessionState,
    pub frames_processed: u64,
    pub output: Option<PathBuf>,
    pub live_encoders: usize,
}

/// Serializes streaming sessions
pub struct StreamManager {
    binary: EncoderBinary,
    tracker: EncoderTracker,
    drain_timeout: Option<Duration>,
    current: Mutex<Option<StreamingSession>>,
    last: SyncMutex<Option<SessionSummary>>,
    event_tx: broadcast::Sender<ExportEvent>,
}

impl StreamManager {
    /// Create a manager using `binary` for every session
    pub fn new(binary: EncoderBinary) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            binary,
            tracker: EncoderTracker::new(),
            drain_timeout: None,
            current: Mutex::new(None),
            last: SyncMutex::new(None),
            event_tx,
        }
    }

    /// Kill encoders that have not exited this long after their input closed
    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<ExportEvent> {
        self.event_tx.subscribe()
    }

    pub fn tracker(&self) -> &EncoderTracker {
        &self.tracker
    }

    /// Start a new session, draining the current one first
    pub async fn start(&self, request: StreamStart) -> Result<SessionSummary, ExportError> {
        let mut slot = self.current.lock().await;

        if let Some(mut previous) = slot.take() {
            tracing::info!("Stopping previous stream {} before starting a new one", previous.id());
            let _ = self.end_session(&mut previous).await;
        }

        let mut session = StreamingSession::new(request.options.format, request.output);
        if let Err(e) = session.launch(&self.binary, request.options, &self.tracker).await {
            tracing::warn!("Stream {} could not start: {}", session.id(), e);
            *self.last.lock() = Some(session.summary());
            let _ = self.event_tx.send(ExportEvent::SessionFailed {
                id: session.id(),
                message: e.to_string(),
            });
            return Err(e);
        }
        let summary = session.summary();

        let _ = self.event_tx.send(ExportEvent::SessionStarted {
            id: summary.id,
            output: summary.output.clone(),
            format: summary.format,
        });
        *slot = Some(session);

        Ok(summary)
    }

    /// Write one complete frame to the active session
    pub async fn write_frame(&self, bytes: &[u8]) -> Result<u64, ExportError> {
        let mut intake = self.begin_frame().await?;
        intake.write(bytes).await?;
        intake.finish().await
    }

    /// Start a chunked frame on the active session.
    ///
    /// The session stays locked until the returned intake is finished or dropped.
    pub async fn begin_frame(&self) -> Result<FrameIntake<'_>, ExportError> {
        let mut slot = self.current.lock().await;
        active(&mut slot)?.open_frame().await?;
        Ok(FrameIntake {
            slot,
            events: &self.event_tx,
        })
    }

    /// End the active session and wait for its output
    pub async fn end(&self) -> Result<SessionSummary, ExportError> {
        let mut slot = self.current.lock().await;
        let mut session = slot
            .take()
            .ok_or_else(|| ExportError::SessionNotWritable("no active stream".to_string()))?;
        self.end_session(&mut session).await
    }

    /// Current state, or the outcome of the last session
    pub async fn status(&self) -> StreamStatus {
        let slot = self.current.lock().await;
        let summary = match slot.as_ref() {
            Some(session) => Some(session.summary()),
            None => self.last.lock().clone(),
        };

        match summary {
            Some(summary) => StreamStatus {
                state: summary.state,
                frames_processed: summary.frames_processed,
                output: Some(summary.output),
                live_encoders: self.tracker.live(),
            },
            None => StreamStatus {
                state: SessionState::Idle,
                frames_processed: 0,
                output: None,
                live_encoders: self.tracker.live(),
            },
        }
    }

    /// Drain the active session, if any. Used on server shutdown.
    pub async fn shutdown(&self) {
        let mut slot = self.current.lock().await;
        if let Some(mut session) = slot.take() {
            tracing::info!("Finishing stream {} before shutdown", session.id());
            if let Err(e) = self.end_session(&mut session).await {
                tracing::warn!("Stream ended with error during shutdown: {}", e);
            }
        }
    }

    async fn end_session(
        &self,
        session: &mut StreamingSession,
    ) -> Result<SessionSummary, ExportError> {
        let result = session.end(self.drain_timeout).await;
        *self.last.lock() = Some(session.summary());

        match &result {
            Ok(summary) => {
                let _ = self.event_tx.send(ExportEvent::SessionFinished {
                    id: summary.id,
                    output: summary.output.clone(),
                    frames: summary.frames_processed,
                });
            }
            Err(e) => {
                tracing::warn!("Stream {} failed: {}", session.id(), e);
                let _ = self.event_tx.send(ExportEvent::SessionFailed {
                    id: session.id(),
                    message: e.to_string(),
                });
            }
        }

        result
    }
}

fn active<'a>(
    slot: &'a mut MutexGuard<'_, Option<StreamingSession>>,
) -> Result<&'a mut StreamingSession, ExportError> {
    slot.as_mut()
        .ok_or_else(|| ExportError::SessionNotWritable("no active stream".to_string()))
}

/// A frame being written to the manager's active session.
///
/// Dropping it before [`finish`](Self::finish) abandons the frame.
pub struct FrameIntake<'a> {
    slot: MutexGuard<'a, Option<StreamingSession>>,
    events: &'a broadcast::Sender<ExportEvent>,
}

impl FrameIntake<'_> {
    /// Append a chunk of the frame
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), ExportError> {
        active(&mut self.slot)?.write_chunk(chunk).await
    }

    /// Complete the frame; returns the session's frame count
    pub async fn finish(mut self) -> Result<u64, ExportError> {
        let session = active(&mut self.slot)?;
        let frames = session.close_frame().await?;
        let _ = self.events.send(ExportEvent::FrameWritten {
            id: session.id(),
            frames,
        });
        Ok(frames)
    }
}

impl Drop for FrameIntake<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.slot.as_mut() {
            session.abandon_frame();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::export::options::RawExportOptions;
    use tempfile::tempdir;

    fn options(format: &str) -> ExportOptions {
        ExportOptions::from_input(RawExportOptions {
            format: Some(format.to_string()),
            fps: Some(30.0),
            encoding: Some("image/png".to_string()),
            quiet: true,
            ..Default::default()
        })
        .unwrap()
    }

    fn manager(script: &str) -> StreamManager {
        StreamManager::new(EncoderBinary::wrapped("/bin/sh", ["-c", script, "encoder"]))
    }

    const CAPTURE_STDIN: &str = r#"for last; do :; done; cat > "$last""#;

    #[tokio::test]
    async fn test_five_frames_then_end() {
        let dir = tempdir().unwrap();
        let manager = manager(CAPTURE_STDIN);
        let mut events = manager.subscribe();

        manager
            .start(StreamStart {
                options: options("mp4"),
                output: dir.path().join("out.mp4"),
            })
            .await
            .unwrap();
        for i in 0..5u8 {
            manager.write_frame(&[i]).await.unwrap();
        }

        let summary = manager.end().await.unwrap();
        assert_eq!(summary.frames_processed, 5);
        assert_eq!(summary.state, SessionState::Closed);
        assert_eq!(std::fs::read(dir.path().join("out.mp4")).unwrap(), vec![0, 1, 2, 3, 4]);

        assert!(matches!(events.recv().await.unwrap(), ExportEvent::SessionStarted { .. }));
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert!(matches!(last, Some(ExportEvent::SessionFinished { frames: 5, .. })));

        let status = manager.status().await;
        assert_eq!(status.state, SessionState::Closed);
        assert_eq!(status.frames_processed, 5);
        assert_eq!(status.live_encoders, 0);
    }

    #[tokio::test]
    async fn test_end_without_frames() {
        let dir = tempdir().unwrap();
        let manager = manager("cat > /dev/null");

        manager
            .start(StreamStart {
                options: options("mp4"),
                output: dir.path().join("out.mp4"),
            })
            .await
            .unwrap();

        assert!(matches!(manager.end().await.unwrap_err(), ExportError::NoFramesProcessed));
        assert_eq!(manager.status().await.state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_restart_keeps_one_encoder_alive() {
        let dir = tempdir().unwrap();
        let manager = manager(CAPTURE_STDIN);

        for name in ["first.mp4", "second.mp4"] {
            manager
                .start(StreamStart {
                    options: options("mp4"),
                    output: dir.path().join(name),
                })
                .await
                .unwrap();
            manager.write_frame(b"frame").await.unwrap();
            assert_eq!(manager.tracker().live(), 1);
        }

        manager.end().await.unwrap();
        assert_eq!(manager.tracker().spawned(), 2);
        assert_eq!(manager.tracker().peak(), 1);
        assert_eq!(manager.tracker().live(), 0);
        // The preempted session was still finalized
        assert_eq!(std::fs::read(dir.path().join("first.mp4")).unwrap(), b"frame");
    }

    #[tokio::test]
    async fn test_chunked_intake() {
        let dir = tempdir().unwrap();
        let manager = manager(CAPTURE_STDIN);
        manager
            .start(StreamStart {
                options: options("mp4"),
                output: dir.path().join("out.mp4"),
            })
            .await
            .unwrap();

        let mut intake = manager.begin_frame().await.unwrap();
        intake.write(b"ab").await.unwrap();
        intake.write(b"cd").await.unwrap();
        assert_eq!(intake.finish().await.unwrap(), 1);

        manager.end().await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("out.mp4")).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_frames_without_stream_are_rejected() {
        let manager = manager(CAPTURE_STDIN);
        let err = manager.write_frame(b"frame").await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(manager.end().await.is_err());
        assert_eq!(manager.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_drain_timeout_kills_hung_encoder() {
        let dir = tempdir().unwrap();
        let manager = manager("exec sleep 30").with_drain_timeout(Some(Duration::from_millis(200)));
        manager
            .start(StreamStart {
                options: options("mp4"),
                output: dir.path().join("out.mp4"),
            })
            .await
            .unwrap();
        manager.write_frame(b"frame").await.unwrap();

        let err = manager.end().await.unwrap_err();
        assert!(matches!(err, ExportError::EncoderTimeout(_)));
        assert_eq!(manager.tracker().live(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_active_stream() {
        let dir = tempdir().unwrap();
        let manager = manager(CAPTURE_STDIN);
        manager
            .start(StreamStart {
                options: options("mp4"),
                output: dir.path().join("out.mp4"),
            })
            .await
            .unwrap();
        manager.write_frame(b"frame").await.unwrap();

        manager.shutdown().await;
        assert_eq!(manager.tracker().live(), 0);
        assert_eq!(manager.status().await.state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_intake_fails_piped_stream() {
        let dir = tempdir().unwrap();
        let manager = manager(CAPTURE_STDIN);
        manager
            .start(StreamStart {
                options: options("mp4"),
                output: dir.path().join("out.mp4"),
            })
            .await
            .unwrap();

        manager.write_frame(b"A").await.unwrap();
        {
            let mut intake = manager.begin_frame().await.unwrap();
            intake.write(b"PARTIAL").await.unwrap();
        }

        let err = manager.write_frame(b"B").await.unwrap_err();
        assert!(err.is_recoverable());
        let status = manager.status().await;
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.frames_processed, 1);

        assert!(manager.end().await.is_err());
        assert_eq!(manager.status().await.state, SessionState::Failed);
        assert_eq!(manager.tracker().live(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_is_reported_by_status() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"not a directory").unwrap();
        let manager = manager(CAPTURE_STDIN);
        let mut events = manager.subscribe();

        manager
            .start(StreamStart {
                options: options("mp4"),
                output: dir.path().join("a.mp4"),
            })
            .await
            .unwrap();
        manager.write_frame(b"frame").await.unwrap();

        let second = dir.path().join("file").join("b.mp4");
        let err = manager
            .start(StreamStart {
                options: options("mp4"),
                output: second.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Io(_)));

        let status = manager.status().await;
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.output, Some(second));
        assert_eq!(status.frames_processed, 0);
        assert_eq!(manager.tracker().live(), 0);
        // The preempted stream was still finalized
        assert_eq!(std::fs::read(dir.path().join("a.mp4")).unwrap(), b"frame");

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert!(matches!(last, Some(ExportEvent::SessionFailed { .. })));
    }
}
