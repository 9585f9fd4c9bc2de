//! Per-request spans.

use std::time::Duration;

use tracing::{info_span, Span};
use uuid::Uuid;

/// Record outcomes into spans created with empty `status` fields.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;

    fn record_timing(&self, device: Duration, driver: Duration);
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        if let Err(e) = result {
            self.record("status", "error");
            self.record("error.message", tracing::field::display(e));
        } else {
            self.record("status", "ok");
        }
    }

    fn record_timing(&self, device: Duration, driver: Duration) {
        self.record("device_us", device.as_micros() as u64);
        self.record("driver_us", driver.as_micros() as u64);
    }
}

/// Span factory for one execution request.
pub struct ExecutionSpan;

impl ExecutionSpan {
    /// A span with a fresh request id. `mode` is `sync`, `async` or `fenced`.
    pub fn new(model_id: u64, mode: &'static str) -> Span {
        let request_id = Uuid::new_v4();
        info_span!(
            "execution",
            request_id = %request_id,
            model_id,
            mode,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            device_us = tracing::field::Empty,
            driver_us = tracing::field::Empty,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_subscriber_is_harmless() {
        let span = ExecutionSpan::new(7, "sync");
        let failed: Result<(), String> = Err("boom".into());
        span.record_result(&failed);
        span.record_timing(Duration::from_micros(5), Duration::from_micros(9));
        span.record_result(&Ok::<(), String>(()));
    }
}
