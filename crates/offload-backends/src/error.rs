//! Error types for memory handles, kernels and backends

use crate::backend::{BackendKind, Residency};
use crate::memory::HandleId;
use std::fmt;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors raised by handles, kernel validation and backend execution.
///
/// Validation errors (`Allocation`, `OutOfRange`, `ShapeMismatch`,
/// `UnsupportedResidency`, `Indeterminate`) are raised before any output is
/// written. `Execution`, `Cancelled` and `ConcurrentMutation` come from a
/// backend after work was submitted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// A buffer could not be created on the host or the device arena.
    #[error("allocation of {requested} elements failed: {reason}")]
    Allocation { requested: usize, reason: String },

    /// Index access past the end of a handle.
    #[error("index {index} out of range for handle of length {len}")]
    OutOfRange { index: usize, len: usize },

    /// Kernel or bulk-load precondition on operand lengths violated.
    #[error("shape mismatch in {operation}: {detail}")]
    ShapeMismatch { operation: &'static str, detail: String },

    /// Data is not valid at the residency the operation needs, or the
    /// requested migration is impossible.
    #[error("unsupported residency {residency}: {reason}")]
    UnsupportedResidency { residency: Residency, reason: String },

    /// The handle's contents are unknown after an abandoned launch.
    #[error("handle {handle} is indeterminate; call revalidate() or reload it")]
    Indeterminate { handle: HandleId },

    /// The backend failed while running a kernel.
    #[error("{backend} execution failed: {report}")]
    Execution { backend: BackendKind, report: String },

    /// An asynchronous launch was cancelled before it committed.
    #[error("launch of {kernel} was cancelled")]
    Cancelled { kernel: &'static str },

    /// A launch tried to commit over data that changed after it was submitted.
    #[error("concurrent mutation of handle {handle}: expected epoch {expected}, found {found}")]
    ConcurrentMutation { handle: HandleId, expected: u64, found: u64 },
}

impl BackendError {
    pub fn shape_mismatch(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            operation,
            detail: detail.into(),
        }
    }

    pub fn unsupported_residency(residency: Residency, reason: impl Into<String>) -> Self {
        Self::UnsupportedResidency {
            residency,
            reason: reason.into(),
        }
    }

    pub fn execution_error(backend: BackendKind, report: impl fmt::Display) -> Self {
        Self::Execution {
            backend,
            report: report.to_string(),
        }
    }

    /// True for the errors that are detected before any output is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Allocation { .. }
                | Self::OutOfRange { .. }
                | Self::ShapeMismatch { .. }
                | Self::UnsupportedResidency { .. }
                | Self::Indeterminate { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_operation() {
        let err = BackendError::shape_mismatch("axpy", "len(x)=3, len(y)=4");
        assert_eq!(err.to_string(), "shape mismatch in axpy: len(x)=3, len(y)=4");

        let err = BackendError::execution_error(BackendKind::DeviceOffload, "device lost");
        assert_eq!(err.to_string(), "device-offload execution failed: device lost");
    }

    #[test]
    fn validation_classification() {
        assert!(BackendError::OutOfRange { index: 4, len: 4 }.is_validation());
        assert!(!BackendError::Cancelled { kernel: "dot" }.is_validation());
    }
}
