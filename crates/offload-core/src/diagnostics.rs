//! Warning channel for dispatcher decisions that are not errors

use offload_backends::{BackendError, BackendKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;

/// Something a caller may want to know about a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Diagnostic {
    /// The requested backend was missing and host-sequential ran instead.
    Fallback {
        kernel: &'static str,
        requested: BackendKind,
        used: BackendKind,
    },
    /// Validation rejected the kernel before anything moved.
    ShapeRejected { kernel: &'static str, detail: String },
    /// The backend failed after the kernel was submitted.
    ExecutionFailed {
        kernel: &'static str,
        backend: BackendKind,
        detail: String,
    },
    /// A pending run was dropped without `wait`; its output is indeterminate.
    Abandoned { kernel: &'static str, backend: BackendKind },
}

impl Diagnostic {
    pub fn kernel(&self) -> &'static str {
        match self {
            Self::Fallback { kernel, .. }
            | Self::ShapeRejected { kernel, .. }
            | Self::ExecutionFailed { kernel, .. }
            | Self::Abandoned { kernel, .. } => kernel,
        }
    }

    pub(crate) fn from_error(kernel: &'static str, backend: BackendKind, err: &BackendError) -> Self {
        if err.is_validation() {
            Self::ShapeRejected {
                kernel,
                detail: err.to_string(),
            }
        } else {
            Self::ExecutionFailed {
                kernel,
                backend,
                detail: err.to_string(),
            }
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fallback { kernel, requested, used } => {
                write!(f, "{kernel}: backend {requested} unavailable, ran on {used}")
            }
            Self::ShapeRejected { kernel, detail } => write!(f, "{kernel}: rejected: {detail}"),
            Self::ExecutionFailed { kernel, backend, detail } => {
                write!(f, "{kernel}: {backend} failed: {detail}")
            }
            Self::Abandoned { kernel, backend } => {
                write!(f, "{kernel}: pending {backend} run dropped before wait")
            }
        }
    }
}

/// Receiver for [`Diagnostic`]s.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Logs each diagnostic with `tracing::warn!`. The dispatcher default.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) {
        tracing::warn!(kernel = diagnostic.kernel(), diagnostic = %diagnostic, "dispatch_diagnostic");
    }
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.records.lock().clone()
    }

    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, diagnostic: Diagnostic) {
        self.records.lock().push(diagnostic);
    }
}
