//! Error types and handling
//!
//! Application-level errors and their mapping to HTTP responses.

use crate::export::types::ExportError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Export(e) => match e {
                ExportError::Configuration { .. } => "INVALID_OPTIONS",
                ExportError::EncoderNotFound { .. } => "ENCODER_NOT_FOUND",
                ExportError::OutputExists(_) => "OUTPUT_EXISTS",
                ExportError::InputNotFound(_) => "INPUT_NOT_FOUND",
                ExportError::NoSequenceFound(_) => "NO_SEQUENCE_FOUND",
                ExportError::AmbiguousSequence { .. } => "AMBIGUOUS_SEQUENCE",
                ExportError::SessionNotWritable(_) => "SESSION_NOT_WRITABLE",
                ExportError::EncoderSpawn { .. } => "ENCODER_SPAWN_FAILED",
                ExportError::EncoderExit { .. } => "ENCODER_FAILED",
                ExportError::EncoderTimeout(_) => "ENCODER_TIMEOUT",
                ExportError::NoFramesProcessed => "NO_FRAMES_PROCESSED",
                ExportError::Cancelled => "CANCELLED",
                ExportError::Io(_) => "IO_ERROR",
            },
        }
    }

    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::Serialization(_) => StatusCode::BAD_REQUEST,
            AppError::Io(_) | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Export(e) => match e {
                ExportError::Configuration { .. }
                | ExportError::InputNotFound(_)
                | ExportError::NoSequenceFound(_)
                | ExportError::AmbiguousSequence { .. } => StatusCode::BAD_REQUEST,
                ExportError::SessionNotWritable(_) | ExportError::OutputExists(_) => {
                    StatusCode::CONFLICT
                }
                ExportError::NoFramesProcessed => StatusCode::UNPROCESSABLE_ENTITY,
                ExportError::EncoderNotFound { .. }
                | ExportError::EncoderSpawn { .. }
                | ExportError::EncoderExit { .. }
                | ExportError::EncoderTimeout(_) => StatusCode::BAD_GATEWAY,
                ExportError::Cancelled | ExportError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::warn!("{}", self);
        }
        (status, Json(ErrorResponse::from(self))).into_response()
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
