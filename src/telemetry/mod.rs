//! Logging setup and request spans.

mod logging;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use spans::{ExecutionSpan, SpanExt};
