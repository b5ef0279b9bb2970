//! Backend interface and shared types

mod token;
mod traits;
mod types;

pub use token::{CompletionToken, Completer};
pub use traits::ExecutionBackend;
pub use types::{
    BackendCapabilities, BackendKind, BlockDim, ExecutionHints, GridDim, LaunchConfig, Residency,
    ResidencyRequirement,
};
