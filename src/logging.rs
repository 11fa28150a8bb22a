//! Log subscriber setup for the demo binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to whoever embeds it. `RUST_LOG` overrides the default filter.

use tracing_subscriber::{EnvFilter, fmt};

/// Default filter when `RUST_LOG` is unset.
///
/// Our own events show at debug (dev) or info (release); other crates only
/// surface warnings.
fn default_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "taskgroup=debug,warn"
    } else {
        "taskgroup=info,warn"
    }
}

/// Install a stderr fmt subscriber tagged with worker thread names.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter()));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_names(true)
        .try_init();
}
