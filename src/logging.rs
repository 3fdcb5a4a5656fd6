//! Log destination and tracing subscriber setup.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Open `path` for appending, creating it if needed.
pub fn open_log(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Filter for our own records; `RUST_LOG` directives are added on top.
pub fn env_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::from_default_env().add_directive(
        format!("{}={}", env!("CARGO_PKG_NAME"), level)
            .parse()
            .unwrap_or_else(|_| tracing::Level::INFO.into()),
    )
}

/// Install a JSON subscriber writing one record per line to `file`.
pub fn init(file: Arc<File>, verbose: bool) {
    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_writer(file),
        )
        .init();
}

/// Push everything written so far to disk.
pub fn flush(file: &File) {
    if let Err(e) = file.sync_data() {
        eprintln!("failed to flush log: {}", e);
    }
}
