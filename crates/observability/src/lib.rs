//! Tracing/logging setup shared by folio binaries.

/// Initialize process-wide logging from `RUST_LOG` (default `info`), as JSON.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize logging with an explicit filter and output format.
///
/// `RUST_LOG` still wins when set. Returns whether this call installed the
/// subscriber.
pub fn init_with(level: &str, json: bool) -> bool {
    tracing::init_with(level, json)
}

/// Tracing configuration (filters, layers).
pub mod tracing;
