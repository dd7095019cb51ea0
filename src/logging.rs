//! Tracing subscriber setup

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Normalise a level name (`WARNING`, `critical`, ...) to a tracing directive
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" | "fatal" => "error",
        "off" => "off",
        _ => "info",
    }
}

/// Install the global subscriber: stderr plus an optional append-only file.
///
/// `RUST_LOG` overrides `level`. A file that cannot be opened is reported
/// and skipped. Returns `false` if a subscriber was already installed.
pub fn init(level: &str, log_file: Option<&Path>) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    let mut file_error = None;
    let file_layer = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(e) => {
                file_error = Some(format!("Could not create log file {}: {}", path.display(), e));
                None
            }
        }
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .is_ok();

    if let Some(message) = file_error {
        tracing::warn!("{}", message);
    }
    installed
}
