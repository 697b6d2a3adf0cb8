//! Intake route handlers

use super::AppState;
use crate::export::batch::{default_file_name, resolve_output};
use crate::export::manager::{StreamStart, StreamStatus};
use crate::export::options::{ExportOptions, RawExportOptions};
use crate::export::types::ExportFormat;
use crate::utils::error::{AppError, AppResult};
use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Multipart, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Body of `POST /export/stream-start`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStartBody {
    pub filename: Option<String>,
    #[serde(flatten)]
    pub options: RawExportOptions,
}

/// Shared response shape of the intake routes
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    /// `false` when streaming is disabled on this server
    pub stream: bool,
    pub filename: Option<String>,
    pub output_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub stream: bool,
    #[serde(flatten)]
    pub status: StreamStatus,
}

pub async fn stream_start(
    State(state): State<AppState>,
    Json(body): Json<StreamStartBody>,
) -> AppResult<Json<StreamResponse>> {
    let Some(settings) = state.config.stream.as_ref() else {
        return Ok(Json(disabled_response(&state)));
    };

    let mut raw = body.options;
    // A recognized extension on the requested name beats the server default
    let named_format = body.filename.as_deref().and_then(format_from_name);
    raw.format = raw
        .format
        .or_else(|| named_format.map(|f| f.to_string()))
        .or_else(|| Some(settings.format.to_string()));
    raw.fps = raw.fps.or(Some(settings.fps));
    raw.encoding = raw.encoding.or_else(|| Some(settings.encoding.mime_type().to_string()));
    raw.quiet |= state.config.quiet;
    let options = ExportOptions::from_input(raw)?;

    let name = match body.filename {
        Some(name) => sanitize_file_name(&name)?,
        None => default_file_name(options.format),
    };
    let output = resolve_output(
        Some(Path::new(&name)),
        &state.config.output_dir,
        options.format,
        true,
    )?;

    let summary = state.manager.start(StreamStart { options, output }).await?;
    Ok(Json(StreamResponse {
        stream: true,
        filename: file_name(&summary.output),
        output_name: output_name(&state),
        frame: None,
    }))
}

pub async fn frame(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<StreamResponse>> {
    let field = multipart
        .next_field()
        .await
        .map_err(bad_multipart)?
        .ok_or_else(|| AppError::BadRequest("expected one file field".to_string()))?;

    let Some(settings) = state.config.stream.as_ref() else {
        return save_upload(&state, field).await.map(Json);
    };

    let frames = if settings.chunked {
        write_chunked(&state, field).await?
    } else {
        let bytes = field.bytes().await.map_err(bad_multipart)?;
        state.manager.write_frame(&bytes).await?
    };

    let status = state.manager.status().await;
    Ok(Json(StreamResponse {
        stream: true,
        filename: status.output.as_deref().and_then(file_name),
        output_name: output_name(&state),
        frame: Some(frames),
    }))
}

/// The request body (`{ filename }`) is informational; the active stream is ended
pub async fn stream_end(State(state): State<AppState>) -> AppResult<Json<StreamResponse>> {
    if state.config.stream.is_none() {
        return Ok(Json(disabled_response(&state)));
    }

    let summary = state.manager.end().await?;
    Ok(Json(StreamResponse {
        stream: true,
        filename: file_name(&summary.output),
        output_name: output_name(&state),
        frame: Some(summary.frames_processed),
    }))
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        stream: state.config.stream.is_some(),
        status: state.manager.status().await,
    })
}

/// Forward a multipart field to the active session chunk by chunk
async fn write_chunked(state: &AppState, mut field: Field<'_>) -> AppResult<u64> {
    let mut intake = state.manager.begin_frame().await?;
    while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
        intake.write(&chunk).await?;
    }
    Ok(intake.finish().await?)
}

/// Save an uploaded file into the output directory unchanged
async fn save_upload(state: &AppState, mut field: Field<'_>) -> AppResult<StreamResponse> {
    let name = field
        .file_name()
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest("file field has no file name".to_string()))?;
    let name = sanitize_file_name(&name)?;

    tokio::fs::create_dir_all(&state.config.output_dir).await?;
    let path = state.config.output_dir.join(&name);
    let mut file = tokio::fs::File::create(&path).await?;
    while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    tracing::info!("Saved {:?}", path);
    Ok(StreamResponse {
        stream: false,
        filename: Some(name),
        output_name: output_name(state),
        frame: None,
    })
}

fn disabled_response(state: &AppState) -> StreamResponse {
    StreamResponse {
        stream: false,
        filename: None,
        output_name: output_name(state),
        frame: None,
    }
}

/// Keep only the last path component of a client supplied name
fn sanitize_file_name(name: &str) -> AppResult<String> {
    Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("invalid file name \"{name}\"")))
}

fn format_from_name(name: &str) -> Option<ExportFormat> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(ExportFormat::parse)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

fn output_name(state: &AppState) -> Option<String> {
    let dir = &state.config.output_dir;
    file_name(dir).or_else(|| Some(dir.to_string_lossy().to_string()))
}

fn bad_multipart(error: MultipartError) -> AppError {
    AppError::BadRequest(error.body_text())
}
