//! Subscriber setup for hosts that do not install their own.
//!
//! The filter is read from `TXBRIDGE_LOG`, then `RUST_LOG`, and falls back to
//! the level passed in. Without the `logging` feature every function is a
//! no-op and the crate only emits `tracing` events.

#[cfg(feature = "logging")]
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "TXBRIDGE_LOG";

#[cfg(feature = "logging")]
fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install a global subscriber at `info`.
///
/// ```rust
/// txbridge_core::logging::init();
/// ```
#[cfg(feature = "logging")]
pub fn init() {
    init_with_level("info")
}

/// Install a global subscriber at `level` unless the environment overrides
/// it. Returns quietly when a subscriber is already set, since a host
/// process may load the extension more than once.
#[cfg(feature = "logging")]
pub fn init_with_level(level: &str) {
    let _ = fmt()
        .with_env_filter(filter(level))
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_line_number(true)
        .try_init();
}

/// Verbose subscriber writing through the test harness capture.
#[cfg(feature = "logging")]
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(not(feature = "logging"))]
pub fn init() {}

#[cfg(not(feature = "logging"))]
pub fn init_with_level(_level: &str) {}

#[cfg(not(feature = "logging"))]
pub fn init_test() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_test();
        init_with_level("trace");
        init();
    }
}
