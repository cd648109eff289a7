use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static TRACING_INITIALISED: OnceLock<()> = OnceLock::new();

/// Installs structured logging for embedders and test runs.
///
/// Interactive terminals get pretty output; everything else gets JSON lines.
/// Repeated calls are no-ops, so every test can call this safely.
pub fn initialise_tracing() {
    TRACING_INITIALISED.get_or_init(|| {
        let log_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let result = if io::stderr().is_terminal() {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(false)
                        .with_writer(io::stderr)
                        .with_filter(log_filter),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_target(false)
                        .with_writer(io::stderr)
                        .with_filter(log_filter),
                )
                .try_init()
        };
        // Another subscriber being installed already is fine.
        let _ = result;
    });
}
