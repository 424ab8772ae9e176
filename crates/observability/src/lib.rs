//! Tracing/logging setup shared by every caseflow binary.

/// Initialize process-wide structured logging with a `RUST_LOG` filter.
///
/// JSON unless `CASEFLOW_LOG_FORMAT=pretty`. Safe to call multiple times;
/// subsequent calls become no-ops.
pub fn init() {
    let format = std::env::var("CASEFLOW_LOG_FORMAT")
        .map(|value| tracing::LogFormat::parse(&value))
        .unwrap_or_default();
    tracing::init(format);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
