//! Export types and configuration
//!
//! This module defines the types shared by the batch converter and the
//! streaming session manager: output formats, frame encodings, events and
//! the export error taxonomy.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Mp4,
    Gif,
}

impl ExportFormat {
    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Mp4 => "mp4",
            ExportFormat::Gif => "gif",
        }
    }

    /// Parse a user supplied format name
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Some(ExportFormat::Mp4),
            "gif" => Some(ExportFormat::Gif),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Image encoding of uploaded frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameEncoding {
    #[default]
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/jpeg")]
    Jpeg,
}

impl FrameEncoding {
    /// Parse a MIME type or short name (`image/png`, `png`, `image/jpeg`, `jpg`)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "image/png" | "png" => Some(FrameEncoding::Png),
            "image/jpeg" | "image/jpg" | "jpeg" | "jpg" => Some(FrameEncoding::Jpeg),
            _ => None,
        }
    }

    /// Codec name the encoder expects for piped images of this encoding
    pub fn codec(&self) -> &'static str {
        match self {
            FrameEncoding::Png => "png",
            FrameEncoding::Jpeg => "mjpeg",
        }
    }

    /// File extension used when frames are buffered to disk
    pub fn extension(&self) -> &'static str {
        match self {
            FrameEncoding::Png => "png",
            FrameEncoding::Jpeg => "jpg",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            FrameEncoding::Png => "image/png",
            FrameEncoding::Jpeg => "image/jpeg",
        }
    }
}

/// Streaming session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session has been started
    Idle,
    /// Encoder (or frame buffer) is being prepared
    Starting,
    /// Accepting frames
    Active,
    /// Input closed, waiting for the encoder to exit
    Draining,
    /// Encoder exited cleanly
    Closed,
    /// Spawn failure or non-zero encoder exit
    Failed,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Events published by the stream manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ExportEvent {
    SessionStarted {
        id: Uuid,
        output: PathBuf,
        format: ExportFormat,
    },
    FrameWritten {
        id: Uuid,
        frames: u64,
    },
    SessionFinished {
        id: Uuid,
        output: PathBuf,
        frames: u64,
    },
    SessionFailed {
        id: Uuid,
        message: String,
    },
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Invalid {field}: {message}")]
    Configuration { field: String, message: String },

    #[error(
        "Could not find an ffmpeg binary (searched: {}).\n\n\
         Install ffmpeg and make sure it is on your PATH, set the FFMPEG_PATH \
         environment variable, or install the npm package locally:\n\n    \
         npm install @ffmpeg-installer/ffmpeg --save",
        .searched.join(", ")
    )]
    EncoderNotFound { searched: Vec<String> },

    #[error("The output file already exists: {} (use --force to overwrite)", .0.display())]
    OutputExists(PathBuf),

    #[error("Input file not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error(
        "Could not find any zero-padded image sequence in the folder {}, \
         specify the files manually, e.g. frames/%03d.png",
        .0.display()
    )]
    NoSequenceFound(PathBuf),

    #[error(
        "There are multiple sequences of different {reason} in the folder {}. \
         Remove all the sequences except the one you wish to render, or specify \
         an exact sequence, e.g. frames/%03d.png",
        .dir.display()
    )]
    AmbiguousSequence { dir: PathBuf, reason: String },

    #[error("Session is not writable: {0}")]
    SessionNotWritable(String),

    #[error("Failed to start encoder {program}: {source}")]
    EncoderSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder exited with {}: {stderr}", .status.map(|c| format!("status {c}")).unwrap_or_else(|| "a signal".to_string()))]
    EncoderExit { status: Option<i32>, stderr: String },

    #[error("Encoder did not exit within {0:?} after its input was closed")]
    EncoderTimeout(Duration),

    #[error("No frames were processed, nothing was exported")]
    NoFramesProcessed,

    #[error("Export cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    pub(crate) fn config(field: &str, message: impl Into<String>) -> Self {
        ExportError::Configuration {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Whether the caller can keep going, e.g. by starting a new session
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExportError::SessionNotWritable(_))
    }
}

impl From<ExportError> for String {
    fn from(e: ExportError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!(ExportFormat::parse("GIF"), Some(ExportFormat::Gif));
        assert_eq!(ExportFormat::parse(" mp4 "), Some(ExportFormat::Mp4));
        assert_eq!(ExportFormat::parse("webm"), None);
    }

    #[test]
    fn test_encoding_codecs() {
        assert_eq!(FrameEncoding::parse("image/jpeg"), Some(FrameEncoding::Jpeg));
        assert_eq!(FrameEncoding::Jpeg.codec(), "mjpeg");
        assert_eq!(FrameEncoding::default().codec(), "png");
        assert_eq!(FrameEncoding::parse("image/webp"), None);
    }

    #[test]
    fn test_encoding_serializes_as_mime() {
        let json = serde_json::to_string(&FrameEncoding::Jpeg).unwrap();
        assert_eq!(json, "\"image/jpeg\"");
    }

    #[test]
    fn test_exit_error_message_carries_stderr() {
        let err = ExportError::EncoderExit {
            status: Some(1),
            stderr: "Unknown encoder 'libx264'".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("status 1"));
        assert!(message.contains("libx264"));
    }

    #[test]
    fn test_only_not_writable_is_recoverable() {
        assert!(ExportError::SessionNotWritable("ended".into()).is_recoverable());
        assert!(!ExportError::NoFramesProcessed.is_recoverable());
    }
}
