//! Request outcomes reported to callers.

use std::fmt;
use std::time::Duration;

/// Terminal status of one execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorStatus {
    /// Success.
    #[default]
    None,
    InvalidArgument,
    GeneralFailure,
    OutputInsufficientSize,
    /// A deadline passed or a fence failed; retrying will not help.
    MissedDeadlinePersistent,
}

impl ErrorStatus {
    pub fn is_ok(self) -> bool {
        self == ErrorStatus::None
    }
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorStatus::None => "NONE",
            ErrorStatus::InvalidArgument => "INVALID_ARGUMENT",
            ErrorStatus::GeneralFailure => "GENERAL_FAILURE",
            ErrorStatus::OutputInsufficientSize => "OUTPUT_INSUFFICIENT_SIZE",
            ErrorStatus::MissedDeadlinePersistent => "MISSED_DEADLINE_PERSISTENT",
        };
        f.write_str(name)
    }
}

/// Device and driver durations in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timing {
    pub time_on_device: u64,
    pub time_in_driver: u64,
}

impl Timing {
    /// Sentinel value for "not measured".
    pub const UNKNOWN: u64 = u64::MAX;

    pub const NONE: Timing = Timing {
        time_on_device: Self::UNKNOWN,
        time_in_driver: Self::UNKNOWN,
    };

    pub fn from_durations(device: Duration, driver: Duration) -> Self {
        Self {
            time_on_device: micros(device),
            time_in_driver: micros(driver),
        }
    }

    pub fn is_measured(&self) -> bool {
        *self != Self::NONE
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::NONE
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(Timing::UNKNOWN - 1)
}

/// Produced shape of one model output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputShape {
    pub dimensions: Vec<u32>,
    /// False when the caller's buffer was too small for this output.
    pub is_sufficient: bool,
}

impl OutputShape {
    pub fn new(dimensions: Vec<u32>, is_sufficient: bool) -> Self {
        Self {
            dimensions,
            is_sufficient,
        }
    }
}

/// What a request reports back, exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionResult {
    pub status: ErrorStatus,
    /// One entry per model output, index-aligned with the model's outputs.
    pub output_shapes: Vec<OutputShape>,
    pub timing: Timing,
}

impl ExecutionResult {
    pub fn failed(status: ErrorStatus) -> Self {
        Self {
            status,
            output_shapes: Vec::new(),
            timing: Timing::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmeasured_timing_is_sentinel() {
        let t = Timing::default();
        assert_eq!(t.time_on_device, u64::MAX);
        assert_eq!(t.time_in_driver, u64::MAX);
        assert!(!t.is_measured());
    }

    #[test]
    fn test_timing_in_microseconds() {
        let t = Timing::from_durations(Duration::from_millis(3), Duration::from_micros(3500));
        assert_eq!(t.time_on_device, 3000);
        assert_eq!(t.time_in_driver, 3500);
        assert!(t.is_measured());
    }

    #[test]
    fn test_failed_result() {
        let r = ExecutionResult::failed(ErrorStatus::InvalidArgument);
        assert!(!r.status.is_ok());
        assert!(r.output_shapes.is_empty());
        assert_eq!(r.status.to_string(), "INVALID_ARGUMENT");
    }
}
