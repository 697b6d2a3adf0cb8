//! Streaming export sessions
//!
//! A [`StreamingSession`] accepts frames one at a time while a sketch is
//! running. MP4 sessions pipe every frame straight into a live encoder;
//! GIF sessions buffer frames into a temporary directory and run the two
//! palette passes once the session ends, since palette generation needs
//! the whole sequence.

use crate::export::batch::encode_gif;
use crate::export::binary::EncoderBinary;
use crate::export::command::{self, InputSource};
use crate::export::options::ExportOptions;
use crate::export::process::{EncoderProcess, EncoderTracker};
use crate::export::sequence::sequence_pattern;
use crate::export::temp::{ResourceKind, TempGuard};
use crate::export::types::{ExportError, ExportFormat, SessionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Zero padding of buffered frame file names
const BUFFERED_FRAME_DIGITS: usize = 6;

/// Where a session's frames go
#[async_trait]
trait FrameSink: Send {
    /// Fail with `SessionNotWritable` if no more frames can be accepted
    fn check_writable(&mut self) -> Result<(), ExportError>;

    /// Prepare for frame number `index`
    async fn begin_frame(&mut self, index: u64) -> Result<(), ExportError>;

    /// Append bytes to the current frame
    async fn write(&mut self, chunk: &[u8]) -> Result<(), ExportError>;

    /// Complete the current frame
    async fn end_frame(&mut self) -> Result<(), ExportError>;

    /// Throw away a partially written frame.
    ///
    /// Returns `false` when the bytes already reached the encoder and cannot
    /// be taken back.
    fn discard_frame(&mut self) -> bool;

    /// Close input and produce the output file
    async fn finish(&mut self, frames: u64, timeout: Option<Duration>) -> Result<(), ExportError>;
}

/// MP4: frames are written to the encoder's stdin as they arrive
struct PipedSink {
    process: EncoderProcess,
}

#[async_trait]
impl FrameSink for PipedSink {
    fn check_writable(&mut self) -> Result<(), ExportError> {
        if let Some(status) = self.process.try_exited() {
            return Err(ExportError::SessionNotWritable(format!(
                "encoder already exited ({status})"
            )));
        }
        Ok(())
    }

    async fn begin_frame(&mut self, _index: u64) -> Result<(), ExportError> {
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), ExportError> {
        self.process.write(chunk).await
    }

    async fn end_frame(&mut self) -> Result<(), ExportError> {
        Ok(())
    }

    fn discard_frame(&mut self) -> bool {
        false
    }

    async fn finish(&mut self, _frames: u64, timeout: Option<Duration>) -> Result<(), ExportError> {
        self.process.wait(timeout).await
    }
}

/// GIF: frames are buffered to disk and encoded at the end
struct BufferedSink {
    binary: EncoderBinary,
    options: ExportOptions,
    output: PathBuf,
    tracker: EncoderTracker,
    dir: PathBuf,
    current: Option<(PathBuf, tokio::fs::File)>,
}

#[async_trait]
impl FrameSink for BufferedSink {
    fn check_writable(&mut self) -> Result<(), ExportError> {
        Ok(())
    }

    async fn begin_frame(&mut self, index: u64) -> Result<(), ExportError> {
        let name = format!(
            "{:0width$}.{}",
            index,
            self.options.encoding.extension(),
            width = BUFFERED_FRAME_DIGITS
        );
        let path = self.dir.join(name);
        let file = tokio::fs::File::create(&path).await?;
        self.current = Some((path, file));
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), ExportError> {
        let (_, file) = self.current.as_mut().ok_or_else(|| {
            ExportError::SessionNotWritable("no frame in progress".to_string())
        })?;
        file.write_all(chunk).await?;
        Ok(())
    }

    async fn end_frame(&mut self) -> Result<(), ExportError> {
        if let Some((_, file)) = self.current.as_mut() {
            file.flush().await?;
        }
        self.current = None;
        Ok(())
    }

    fn discard_frame(&mut self) -> bool {
        if let Some((path, file)) = self.current.take() {
            drop(file);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Could not remove partial frame {:?}: {}", path, e),
            }
        }
        true
    }

    async fn finish(&mut self, frames: u64, _timeout: Option<Duration>) -> Result<(), ExportError> {
        self.current = None;
        if frames == 0 {
            return Ok(());
        }

        let pattern = sequence_pattern(
            &self.dir,
            BUFFERED_FRAME_DIGITS,
            self.options.encoding.extension(),
        );
        // Buffered frames are numbered images, so they decode at the input rate
        encode_gif(&self.binary, &self.options, &pattern, &self.output, &self.tracker).await
    }
}

/// Snapshot of a session for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: Uuid,
    pub output: PathBuf,
    pub format: ExportFormat,
    pub state: SessionState,
    pub frames_processed: u64,
    pub started_at: DateTime<Utc>,
}

/// One streaming export
pub struct StreamingSession {
    id: Uuid,
    output: PathBuf,
    format: ExportFormat,
    state: SessionState,
    frames: u64,
    frame_open: bool,
    failure: Option<String>,
    ended: bool,
    started_at: DateTime<Utc>,
    sink: Option<Box<dyn FrameSink>>,
    temp: TempGuard,
}

impl std::fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("id", &self.id)
            .field("output", &self.output)
            .field("state", &self.state)
            .field("frames", &self.frames)
            .finish()
    }
}

impl StreamingSession {
    /// A session in the `Starting` state; nothing runs until [`launch`](Self::launch)
    pub fn new(format: ExportFormat, output: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            output,
            format,
            state: SessionState::Starting,
            frames: 0,
            frame_open: false,
            failure: None,
            ended: false,
            started_at: Utc::now(),
            sink: None,
            temp: TempGuard::new(),
        }
    }

    /// Start a session writing to `output`
    pub async fn start(
        binary: &EncoderBinary,
        options: ExportOptions,
        output: PathBuf,
        tracker: &EncoderTracker,
    ) -> Result<Self, ExportError> {
        let mut session = Self::new(options.format, output);
        session.launch(binary, options, tracker).await?;
        Ok(session)
    }

    /// Prepare the sink and move to `Active`, or to `Failed` if that fails.
    ///
    /// MP4 sessions spawn the encoder immediately; GIF sessions create their
    /// frame directory next to the output.
    pub async fn launch(
        &mut self,
        binary: &EncoderBinary,
        options: ExportOptions,
        tracker: &EncoderTracker,
    ) -> Result<(), ExportError> {
        if self.state != SessionState::Starting {
            return Err(ExportError::SessionNotWritable(format!(
                "session is {:?}",
                self.state
            )));
        }
        tracing::debug!("Session {} starting", self.id);

        let opened = open_sink(self.format, &self.output, &self.temp, binary, options, tracker).await;
        match opened {
            Ok(sink) => {
                self.sink = Some(sink);
                self.state = SessionState::Active;
                tracing::info!("Streaming {} export to {:?}", self.format, self.output);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                self.failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            output: self.output.clone(),
            format: self.format,
            state: self.state,
            frames_processed: self.frames,
            started_at: self.started_at,
        }
    }

    /// Write one complete frame
    pub async fn write_frame(&mut self, bytes: &[u8]) -> Result<u64, ExportError> {
        let mut writer = self.begin_frame().await?;
        writer.write(bytes).await?;
        writer.finish().await
    }

    /// Start a frame whose bytes arrive in chunks.
    ///
    /// The frame only counts once [`FrameWriter::finish`] is called.
    pub async fn begin_frame(&mut self) -> Result<FrameWriter<'_>, ExportError> {
        self.open_frame().await?;
        Ok(FrameWriter {
            session: self,
            bytes: 0,
        })
    }

    pub(crate) async fn open_frame(&mut self) -> Result<(), ExportError> {
        if self.state != SessionState::Active {
            return Err(ExportError::SessionNotWritable(match &self.failure {
                Some(reason) => reason.clone(),
                None => format!("session is {:?}", self.state),
            }));
        }
        let sink = sink(&mut self.sink)?;
        if let Err(e) = sink.check_writable() {
            self.state = SessionState::Failed;
            return Err(e);
        }

        self.frame_open = true;
        let begun = sink.begin_frame(self.frames).await;
        if let Err(e) = begun {
            self.abandon_frame();
            return Err(e);
        }
        Ok(())
    }

    pub(crate) async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ExportError> {
        let sink = sink(&mut self.sink)?;
        if let Err(e) = sink.write(chunk).await {
            // Only an exited encoder fails the session
            if sink.check_writable().is_err() {
                self.state = SessionState::Failed;
            }
            return Err(e);
        }
        Ok(())
    }

    pub(crate) async fn close_frame(&mut self) -> Result<u64, ExportError> {
        sink(&mut self.sink)?.end_frame().await?;
        self.frame_open = false;
        self.frames += 1;
        Ok(self.frames)
    }

    /// Give up on a frame that was opened but never closed.
    ///
    /// Buffered frames are deleted. Piped bytes cannot be recalled, so the
    /// encoder input is corrupt and the session fails.
    pub(crate) fn abandon_frame(&mut self) {
        if !self.frame_open {
            return;
        }
        self.frame_open = false;

        let discarded = self.sink.as_mut().map_or(true, |sink| sink.discard_frame());
        if discarded {
            tracing::warn!("Session {} dropped incomplete frame {}", self.id, self.frames + 1);
        } else if self.state == SessionState::Active {
            let reason = format!("frame {} was abandoned mid-write", self.frames + 1);
            tracing::warn!("Session {} failed: {}", self.id, reason);
            self.state = SessionState::Failed;
            self.failure = Some(reason);
        }
    }

    /// Close input, wait for the encoder and report the outcome.
    ///
    /// A session that never received a frame always ends in
    /// `NoFramesProcessed`, whatever the encoder did.
    pub async fn end(&mut self, timeout: Option<Duration>) -> Result<SessionSummary, ExportError> {
        if self.ended {
            return match self.state {
                SessionState::Closed => Ok(self.summary()),
                _ => Err(ExportError::SessionNotWritable("session already ended".to_string())),
            };
        }
        self.ended = true;

        let Some(sink) = self.sink.as_mut() else {
            self.state = SessionState::Failed;
            return Err(ExportError::SessionNotWritable(
                "session was never started".to_string(),
            ));
        };

        tracing::debug!("Session {} draining after {} frame(s)", self.id, self.frames);
        let failure = self.failure.take();
        self.state = SessionState::Draining;
        let result = sink.finish(self.frames, timeout).await;

        if let Err(e) = self.temp.release_all() {
            tracing::warn!("Could not remove session temporary files: {}", e);
        }

        if self.frames == 0 {
            if let Err(e) = &result {
                tracing::debug!("Encoder result for empty session: {}", e);
            }
            self.state = SessionState::Failed;
            return Err(ExportError::NoFramesProcessed);
        }

        match (result, failure) {
            (Ok(()), Some(reason)) => {
                self.state = SessionState::Failed;
                Err(ExportError::SessionNotWritable(reason))
            }
            (Ok(()), None) => {
                self.state = SessionState::Closed;
                tracing::info!("Exported {} frame(s) to {:?}", self.frames, self.output);
                Ok(self.summary())
            }
            (Err(e), _) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }
}

async fn open_sink(
    format: ExportFormat,
    output: &Path,
    temp: &TempGuard,
    binary: &EncoderBinary,
    options: ExportOptions,
    tracker: &EncoderTracker,
) -> Result<Box<dyn FrameSink>, ExportError> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let sink: Box<dyn FrameSink> = match format {
        ExportFormat::Mp4 => {
            let invocation =
                command::mp4(binary, &options, &InputSource::Pipe(options.encoding), output);
            let process = EncoderProcess::spawn(&invocation, options.quiet, tracker)?;
            Box::new(PipedSink { process })
        }
        ExportFormat::Gif => {
            let dir = temp.acquire(ResourceKind::Directory, output_dir(output), ".frames-", "")?;
            Box::new(BufferedSink {
                binary: binary.clone(),
                options,
                output: output.to_path_buf(),
                tracker: tracker.clone(),
                dir,
                current: None,
            })
        }
    };
    Ok(sink)
}

fn sink(sink: &mut Option<Box<dyn FrameSink>>) -> Result<&mut Box<dyn FrameSink>, ExportError> {
    sink.as_mut()
        .ok_or_else(|| ExportError::SessionNotWritable("session was never started".to_string()))
}

/// An in-progress frame of a [`StreamingSession`].
///
/// Dropping it before [`finish`](Self::finish) abandons the frame.
pub struct FrameWriter<'a> {
    session: &'a mut StreamingSession,
    bytes: usize,
}

impl FrameWriter<'_> {
    /// Append a chunk of the frame
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), ExportError> {
        self.session.write_chunk(chunk).await?;
        self.bytes += chunk.len();
        Ok(())
    }

    /// Mark the frame complete; returns the new frame count
    pub async fn finish(mut self) -> Result<u64, ExportError> {
        let frames = self.session.close_frame().await?;
        tracing::trace!("Frame {} written ({} bytes)", frames, self.bytes);
        Ok(frames)
    }
}

impl Drop for FrameWriter<'_> {
    fn drop(&mut self) {
        self.session.abandon_frame();
    }
}

fn output_dir(output: &Path) -> &Path {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
