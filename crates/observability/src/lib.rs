//! Process-wide tracing setup shared by the service binaries.

pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize tracing/logging, reading `RUST_LOG` and `LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env());
}
