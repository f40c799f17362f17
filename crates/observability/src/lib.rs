//! Tracing and logging setup shared by processes embedding the job engine.

/// Initialize process-wide logging from the given configuration.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init(config: &LogConfig) {
    tracing::init(config);
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogConfig;
