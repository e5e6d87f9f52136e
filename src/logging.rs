//! Operator diagnostics via `tracing`.
//!
//! Two sinks: compact human-readable output on stderr, filtered by
//! `RUST_LOG` (default `conductor=info`), and a JSON line file under
//! `.conductor/logs/` for after-the-fact debugging. The per-run journal in
//! `events.jsonl` is a separate product surface and does not go through
//! here.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber. The returned guard must be held for
/// the life of the process so buffered file output is flushed on exit.
pub fn init(log_dir: &Path, verbose: bool) -> WorkerGuard {
    let default = if verbose {
        "conductor=debug"
    } else {
        "conductor=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = std::fs::create_dir_all(log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "conductor.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(fmt::layer().json().with_writer(file_writer).with_ansi(false))
        .init();

    guard
}
