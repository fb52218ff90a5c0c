//! Logging setup shared by the api and worker binaries.

/// Initialize process-wide tracing.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filter, output format).
pub mod tracing;
