//! Tracing/logging setup shared by the pipeline binaries.

/// Initialize process-wide logging from the environment (`RUST_LOG`, `LOG_FORMAT`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, init_with};
