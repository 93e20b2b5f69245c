//! Logging setup.
//!
//! Library code only emits `tracing` events; binaries and tests call
//! [`init`] once to print them.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "repliq=info";

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default
/// [`DEFAULT_FILTER`]). Calling it again is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
