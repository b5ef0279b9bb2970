//! Memory handles, kernels and execution backends for offloadable
//! vector/matrix primitives
//!
//! This crate provides:
//! - **Memory handles**: fixed-length `f64` buffers with explicit host/device residency
//! - **Kernels**: `axpy`, `scal`, `dot` and `matvec` descriptors with shape validation
//! - **Backend trait**: one execution interface over interchangeable strategies
//! - **Backends**: host-sequential, host-parallel and device-offload
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │           Kernel (operation + borrowed handles)         │
//! └──────────────────────────┬─────────────────────────────┘
//!                            │ ExecutionBackend::execute / launch
//!          ┌─────────────────┼──────────────────┐
//!          ▼                 ▼                  ▼
//!   ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//!   │    Host     │   │    Host     │   │    Device    │
//!   │ Sequential  │   │  Parallel   │   │   Offload    │
//!   └─────────────┘   └─────────────┘   └──────┬───────┘
//!                                              │
//!                                    DeviceContext (arena + units)
//! ```
//!
//! # Usage
//!
//! ```rust
//! use offload_backends::{ExecutionBackend, ExecutionHints, HostSequentialBackend, Kernel, MemoryHandle};
//!
//! # fn main() -> offload_backends::Result<()> {
//! let mut x = MemoryHandle::from_vec(vec![1.0; 10]);
//! let mut y = MemoryHandle::from_vec(vec![0.5; 10]);
//!
//! HostSequentialBackend.execute(&mut Kernel::axpy(0.5, &mut x, &mut y), &ExecutionHints::default())?;
//! assert_eq!(y.to_vec()?, vec![1.0; 10]);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod error;
pub mod kernel;
pub mod memory;

// Re-export public API
pub use backend::{
    BackendCapabilities, BackendKind, BlockDim, CompletionToken, Completer, ExecutionBackend, ExecutionHints, GridDim,
    LaunchConfig, Residency, ResidencyRequirement,
};
pub use backends::{
    DeviceBuffer, DeviceConfig, DeviceContext, DeviceOffloadBackend, HostParallelBackend, HostSequentialBackend,
};
pub use error::{BackendError, Result};
pub use kernel::{Kernel, KernelOutput, MatrixShape, OperandRole};
pub use memory::{HandleId, MemoryHandle};
