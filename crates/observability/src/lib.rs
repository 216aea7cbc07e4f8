//! Tracing and logging setup shared by every dispatchq binary.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use crate::tracing::{LogFormat, ParseLogFormatError};

/// Initialize process-wide tracing.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(format: LogFormat, verbose: bool) {
    tracing::init(format, verbose);
}
