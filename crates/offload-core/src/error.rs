//! Error types for offload-core operations

use offload_backends::{BackendError, BackendKind};

/// Result type for offload-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the dispatcher and its configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Validation or execution error from a handle or backend.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The requested backend is not registered and fallback is disabled.
    #[error("backend {requested} is not registered and fallback is disabled")]
    BackendUnavailable { requested: BackendKind },

    /// Configuration value out of range or unparsable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// The underlying backend error, if any.
    pub fn as_backend(&self) -> Option<&BackendError> {
        match self {
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}
