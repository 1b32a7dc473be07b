// src/logging.rs
//! Logging setup
//!
//! Log lines go to stderr so they never interleave with the terminal display.
//! The filter comes from `RUST_LOG` when set, otherwise from the verbosity flag.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive for a verbosity level
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "fleet_tracker=info,warn",
        1 => "fleet_tracker=debug,info",
        _ => "trace",
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(verbose: u8) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}
