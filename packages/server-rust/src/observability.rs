//! Logging setup and span helpers.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line (for hosted runs).
    Json,
    /// Human-readable logs (for development).
    #[default]
    Pretty,
}

/// Installs the global subscriber, writing to stderr.
///
/// Safe to call more than once; later calls are no-ops. Levels come from
/// `RUST_LOG` (e.g. `info`, `triage_server=debug`), defaulting to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // A subscriber installed elsewhere (e.g. by a test runner) wins.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init(),
        };
    });
}

/// Span covering one local run seeded on `target`.
#[must_use]
pub fn run_span(mode: &str, target: &str) -> Span {
    tracing::info_span!("run", mode = mode, target = target)
}
