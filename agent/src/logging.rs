//! Diagnostic tracing for debugging the agent.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: developer diagnostics via `RUST_LOG`, written
//!   to stderr. Not part of what the agent shows the user.
//!
//! - **Status lines (`io::operator`)**: progress, confirmations and the final
//!   summary, always shown and unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=agent=debug agent root@web1
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
