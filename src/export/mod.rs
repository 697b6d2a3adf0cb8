//! Frame-sequence export
//!
//! Turns frames into GIF or MP4 files with an external ffmpeg process, either
//! from files already on disk ([`batch`]) or from frames uploaded while a
//! sketch runs ([`manager`]).

pub mod batch;
pub mod binary;
pub mod command;
pub mod manager;
pub mod options;
pub mod process;
pub mod sequence;
pub mod session;
pub mod temp;
pub mod types;

pub use batch::{convert, convert_until, ConvertOutcome, ConvertRequest};
pub use binary::{EncoderBinary, EncoderLocator};
pub use command::{EncoderInvocation, GifPasses, InputMode, InputSource};
pub use manager::{FrameIntake, StreamManager, StreamStart, StreamStatus};
pub use options::{ExportOptions, RawExportOptions};
pub use process::{EncoderProcess, EncoderTracker};
pub use session::{FrameWriter, SessionSummary, StreamingSession};
pub use temp::{ResourceKind, TempGuard};
pub use types::{ExportError, ExportEvent, ExportFormat, FrameEncoding, SessionState};
