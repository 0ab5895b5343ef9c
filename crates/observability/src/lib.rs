//! Shared tracing/logging setup for payflow binaries.

/// Tracing subscriber configuration (format, filters).
pub mod tracing;

pub use self::tracing::{LogFormat, ParseLogFormatError, init, init_with};
