//! Process-wide logging setup for fleetline binaries.

pub mod tracing;

pub use self::tracing::{LogFormat, init_with};

/// Initialize tracing with the defaults (JSON, `RUST_LOG` or `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    init_with(LogFormat::from_env(), "info");
}
