//! Diagnostics for the CLI.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG` (default `warn`).
//! The audit trail is the evidence sink, not this.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
