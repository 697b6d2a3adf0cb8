//! Frame intake HTTP server
//!
//! Exposes the streaming export over HTTP so a sketch running in a browser
//! can start a stream, upload frames as they render, and finish the export.

mod routes;

use crate::config::ServeConfig;
use crate::export::binary::EncoderBinary;
use crate::export::manager::StreamManager;
use crate::export::types::ExportEvent;
use crate::utils::error::AppResult;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Largest accepted upload; uncompressed frames of large canvases are big
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Shared state of the intake routes
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServeConfig>,
    pub manager: Arc<StreamManager>,
}

impl AppState {
    pub fn new(config: ServeConfig, manager: Arc<StreamManager>) -> Self {
        Self {
            config: Arc::new(config),
            manager,
        }
    }
}

/// Build the intake router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/export/stream-start", post(routes::stream_start))
        .route("/export/frame", post(routes::frame))
        .route("/export/stream-end", post(routes::stream_end))
        .route("/export/status", get(routes::status))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Run the intake server until `shutdown` resolves, then finish any active stream
pub async fn serve<F>(config: ServeConfig, binary: EncoderBinary, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.address()?;
    let drain_timeout = config.stream.as_ref().and_then(|s| s.drain_timeout);
    let manager = Arc::new(StreamManager::new(binary).with_drain_timeout(drain_timeout));

    spawn_event_logger(&manager);

    if config.stream.is_some() {
        tracing::info!("Streaming export enabled, writing to {:?}", config.output_dir);
    } else {
        tracing::info!("Streaming disabled, uploaded frames are saved to {:?}", config.output_dir);
    }

    let state = AppState::new(config, Arc::clone(&manager));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Frame intake listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    manager.shutdown().await;
    tracing::info!("Frame intake stopped");
    Ok(())
}

fn spawn_event_logger(manager: &StreamManager) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ExportEvent::SessionStarted { id, output, format }) => {
                    tracing::info!("Stream {} started: {} -> {:?}", id, format, output);
                }
                Ok(ExportEvent::FrameWritten { id, frames }) => {
                    tracing::trace!("Stream {} frame {}", id, frames);
                }
                Ok(ExportEvent::SessionFinished { id, output, frames }) => {
                    tracing::info!("Stream {} finished: {} frame(s) -> {:?}", id, frames, output);
                }
                Ok(ExportEvent::SessionFailed { id, message }) => {
                    tracing::error!("Stream {} failed: {}", id, message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event logger skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
