//! Logging setup shared by the binary and the test harness.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global tracing subscriber and panic hook. Idempotent, so the
/// binary and any number of tests can all call it.
///
/// The filter comes from `RUST_LOG` when set, otherwise from
/// `default_level`.
pub fn setup_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
        log_panics::init();
    });
}
