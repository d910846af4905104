//! Diagnostic tracing on stderr, filtered by `RUST_LOG`.
//!
//! This is for people debugging taskpilot itself. What a run produced
//! (attempt logs, the progress log, run records) is written by
//! [`crate::io::store`] whatever the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Falls back to `warn` when `RUST_LOG` is unset
/// or unparsable.
///
/// ```bash
/// RUST_LOG=taskpilot::orchestrator=debug,taskpilot::attempt=trace taskpilot run doc_abc123
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // Keeps the first subscriber if one is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact(),
        )
        .try_init();
}
