//! Tracing subscriber setup.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a stderr `fmt` subscriber filtered by `RUST_LOG`.
///
/// Safe to call repeatedly; only the first call has an effect, and an already
/// installed global subscriber is left alone.
pub fn init_from_env() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quarry=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}
