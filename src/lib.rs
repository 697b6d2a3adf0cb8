//! sketch-export - turn a running sketch's frames into GIF and MP4 files.
//!
//! This is the library crate behind the `sketch-export` binary. It provides
//! the batch converter, the streaming session manager and the HTTP frame
//! intake server, all driving an external ffmpeg process.

pub mod config;
pub mod export;
pub mod server;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging.
///
/// `RUST_LOG` takes precedence; otherwise exporter messages are shown at
/// info level, or only warnings when `quiet` is set.
pub fn init_tracing(quiet: bool) {
    let default_filter = if quiet { "warn" } else { config::DEFAULT_LOG_FILTER };

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
