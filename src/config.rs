//! Runtime configuration
//!
//! Environment variables read by the exporter and the settings of the
//! `serve` command.

use crate::export::types::{ExportFormat, FrameEncoding};
use crate::utils::error::{AppError, AppResult};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Overrides encoder discovery with an explicit ffmpeg path
pub const ENCODER_PATH_ENV: &str = "FFMPEG_PATH";

/// When set, every encoder command line is logged at info level
pub const LOG_COMMANDS_ENV: &str = "SKETCH_EXPORT_LOG_COMMANDS";

/// Default log filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "sketch_export=info";

/// Whether encoder command lines should be logged at info level
pub fn log_commands_enabled() -> bool {
    std::env::var(LOG_COMMANDS_ENV)
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

/// Defaults applied to streams started over HTTP
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// Format used when a start request does not name one
    pub format: ExportFormat,
    /// Frame encoding used when a start request does not name one
    pub encoding: FrameEncoding,
    /// Frame rate used when a start request does not give one
    pub fps: f64,
    /// Forward uploaded frames chunk by chunk instead of buffering each one
    pub chunked: bool,
    /// Kill an encoder still running this long after its input was closed
    pub drain_timeout: Option<Duration>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            format: ExportFormat::Mp4,
            encoding: FrameEncoding::Png,
            fps: 24.0,
            chunked: false,
            drain_timeout: None,
        }
    }
}

/// Settings of the frame intake server
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    /// Where exports and saved frames are written
    pub output_dir: PathBuf,
    /// `None` disables streaming; uploaded frames are then saved as files
    pub stream: Option<StreamSettings>,
    /// Do not forward encoder output to the log
    pub quiet: bool,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9966,
            output_dir: PathBuf::from("."),
            stream: Some(StreamSettings::default()),
            quiet: false,
        }
    }
}

impl ServeConfig {
    /// Socket address to bind
    pub fn address(&self) -> AppResult<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse::<SocketAddr>()
            .map_err(|e| AppError::Config(format!("invalid listen address {addr}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        for value in ["1", "true", "yes", "debug"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["", "0", "false", "OFF", " no "] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn test_default_address() {
        let config = ServeConfig::default();
        assert_eq!(config.address().unwrap().port(), 9966);
        assert!(config.stream.is_some());
    }

    #[test]
    fn test_bad_host_is_rejected() {
        let config = ServeConfig {
            host: "not a host".to_string(),
            ..Default::default()
        };
        assert!(config.address().is_err());
    }
}
