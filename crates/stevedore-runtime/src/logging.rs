//! Logging setup.
//!
//! One `tracing` subscriber for the whole process, filtered through
//! `RUST_LOG` with a sensible default. Initialized by the daemon before
//! anything else runs; repeat initialization is a no-op so embedding the
//! runtime in tests stays painless.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initializes logging at `info` unless `RUST_LOG` says otherwise.
pub fn init() {
    init_with_filter("info");
}

/// Initializes logging with a custom default filter directive.
pub fn init_with_filter(default: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default.to_string()));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
