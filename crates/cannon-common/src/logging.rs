//! Diagnostic output for the daemon.
//!
//! Events are written through a non-blocking writer so a slow terminal
//! or pipe never stalls a dispatch loop; the buffer capacity comes from
//! the `--log-buffer` flag. Format is JSON unless development mode asks
//! for human-readable output.
//!
//! `RUST_LOG` filters as usual (default `info`).

use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber.
///
/// The returned guard flushes buffered events on drop; keep it alive
/// for the life of the process.
pub fn init(development: bool, buffer: usize) -> WorkerGuard {
    let (writer, guard) = NonBlockingBuilder::default()
        .buffered_lines_limit(buffer)
        .lossy(true)
        .finish(std::io::stdout());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if development {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_ansi(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
    }

    guard
}
