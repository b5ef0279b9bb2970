//! # offload-core - Backend dispatch for linear-algebra primitives
//!
//! Runs the kernels defined in `offload-backends` on whichever backend
//! suits them, moving handle data between host and device as needed.
//!
//! ## Architecture
//!
//! ```text
//! ops::linalg / Dispatcher::run
//!   ↓ selects from
//! BackendRegistry (host-sequential, host-parallel, device-offload)
//!   ↓ migrates operands, executes, migrates outputs back
//! MemoryHandle (Host | Device | Mirrored | Indeterminate)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use offload_backends::{DeviceConfig, Kernel, MemoryHandle};
//! use offload_core::{BackendChoice, Dispatcher, DispatcherConfig, RunConfig};
//!
//! # fn main() -> offload_core::Result<()> {
//! let exec = Dispatcher::new(DispatcherConfig::with_device(DeviceConfig::default()))?;
//!
//! let mut x = MemoryHandle::from_vec(vec![1.0; 10]);
//! let mut y = MemoryHandle::from_vec(vec![0.5; 10]);
//!
//! let config = RunConfig {
//!     backend: BackendChoice::DeviceOffload,
//!     ..RunConfig::default()
//! };
//! exec.run(Kernel::axpy(0.5, &mut x, &mut y), &config)?;
//! assert_eq!(y.to_vec()?, vec![1.0; 10]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`dispatcher`] - backend selection, residency coordination, async runs
//! - [`registry`] - backends keyed by kind
//! - [`config`] - `RunConfig` / `DispatcherConfig`, env and JSON loading
//! - [`diagnostics`] - warning channel (fallbacks, rejected and failed runs)
//! - [`instrumentation`] - per-run metrics and the kernel profiler
//! - [`ops::linalg`] - `axpy`, `scal`, `dot`, `matvec`

pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod instrumentation;
pub mod ops;
pub mod registry;

// Re-export primary types
pub use config::{BackendChoice, DispatcherConfig, RunConfig, DEFAULT_PARALLEL_THRESHOLD};
pub use diagnostics::{Diagnostic, DiagnosticSink, RecordingSink, TracingSink};
pub use dispatcher::{global, install_global, Dispatcher, PendingRun, RunOutcome};
pub use error::{Error, Result};
pub use instrumentation::{ExecutionMetrics, KernelProfiler, KernelStats};
pub use registry::BackendRegistry;
