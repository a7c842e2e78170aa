//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with the defaults; the `LIVEFORGE_LOG` environment
/// variable selects the filter, defaulting to warnings only. Output goes
/// to stderr so plan text printed on stdout stays machine-consumable.
pub fn initialize_tracing() {
    let filter = EnvFilter::try_from_env("LIVEFORGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}
