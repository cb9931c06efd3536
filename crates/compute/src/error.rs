use std::time::Duration;
use thiserror::Error;

use crate::element::ElementType;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error("cannot allocate {requested} bytes for `{label}`: {reason}")]
    Allocation {
        label: String,
        requested: u64,
        reason: String,
    },
    #[error("kernel `{name}` failed to build: {reason}")]
    Compilation { name: String, reason: String },
    #[error("device `{device}` is not supported: {reason}")]
    UnsupportedDevice { device: String, reason: String },
    #[error("kernel `{name}` does not match the binding contract: {reason}")]
    BindingContract { name: String, reason: String },
    #[error("group size {requested} exceeds the device maximum of {max}")]
    GroupSizeExceeded { requested: u32, max: u32 },
    #[error("command batch rejected: {0}")]
    Submission(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("dispatch did not complete within {0:?}")]
    DispatchTimeout(Duration),
    #[error("`{label}` expects {expected} elements, got {actual}")]
    LengthMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("expected {expected} elements, got {actual}")]
    ElementTypeMismatch {
        expected: ElementType,
        actual: ElementType,
    },
    #[error("range {start}..{end} is out of bounds for `{label}` ({len} elements)")]
    OutOfBounds {
        label: String,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("`{0}` is referenced by a batch that has not completed")]
    RegionInFlight(String),
    #[error("`{0}` holds undefined contents")]
    UndefinedContents(String),
    #[error("backend not available")]
    BackendUnavailable,
}

/// Where in the dispatcher lifecycle an error belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    /// Raised while acquiring the device, regions or program. The instance
    /// that produced it is unusable; nothing is retried.
    Setup,
    /// Raised by a single `run`. The dispatcher stays usable, retrying is the
    /// caller's decision.
    Run,
    /// The caller broke a precondition (lengths, types, ranges).
    Usage,
}

impl ComputeError {
    #[must_use]
    pub fn phase(&self) -> ErrorPhase {
        match self {
            Self::Allocation { .. }
            | Self::Compilation { .. }
            | Self::UnsupportedDevice { .. }
            | Self::BindingContract { .. }
            | Self::GroupSizeExceeded { .. }
            | Self::BackendUnavailable => ErrorPhase::Setup,
            Self::Submission(_) | Self::DeviceLost(_) | Self::DispatchTimeout(_) => ErrorPhase::Run,
            Self::LengthMismatch { .. }
            | Self::ElementTypeMismatch { .. }
            | Self::OutOfBounds { .. }
            | Self::RegionInFlight(_)
            | Self::UndefinedContents(_) => ErrorPhase::Usage,
        }
    }
}
