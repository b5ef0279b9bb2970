//! Linear algebra operations
//!
//! Thin wrappers that build a [`Kernel`] and dispatch it. Every function
//! validates shapes before touching any handle and returns with outputs
//! host-resident.
//!
//! # Example
//!
//! ```rust
//! use offload_backends::MemoryHandle;
//! use offload_core::{ops::linalg, Dispatcher, RunConfig};
//!
//! # fn main() -> offload_core::Result<()> {
//! let exec = Dispatcher::host_only()?;
//! let mut x = MemoryHandle::from_vec(vec![1.0; 10]);
//! let mut y = MemoryHandle::from_vec(vec![0.5; 10]);
//!
//! linalg::axpy(&exec, 0.5, &mut x, &mut y, &RunConfig::default())?;
//! assert_eq!(y.to_vec()?, vec![1.0; 10]);
//! # Ok(())
//! # }
//! ```

use crate::config::RunConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use offload_backends::{BackendError, BackendKind, Kernel, MatrixShape, MemoryHandle};

/// `y = alpha * x + y`
#[tracing::instrument(skip(exec, x, y, config), fields(n = y.len()))]
pub fn axpy(
    exec: &Dispatcher,
    alpha: f64,
    x: &mut MemoryHandle,
    y: &mut MemoryHandle,
    config: &RunConfig,
) -> Result<()> {
    exec.run(Kernel::axpy(alpha, x, y), config)?;
    Ok(())
}

/// `x = alpha * x`
#[tracing::instrument(skip(exec, x, config), fields(n = x.len()))]
pub fn scal(exec: &Dispatcher, alpha: f64, x: &mut MemoryHandle, config: &RunConfig) -> Result<()> {
    exec.run(Kernel::scal(alpha, x), config)?;
    Ok(())
}

/// `Σ x[i] * y[i]`
#[tracing::instrument(skip(exec, x, y, config), fields(n = x.len()))]
pub fn dot(exec: &Dispatcher, x: &mut MemoryHandle, y: &mut MemoryHandle, config: &RunConfig) -> Result<f64> {
    let output = exec.run(Kernel::dot(x, y), config)?;
    output.scalar().ok_or_else(|| {
        BackendError::execution_error(BackendKind::HostSequential, "dot completed without a scalar result").into()
    })
}

/// Euclidean norm `√(Σ x[i]²)`, reading `x` once.
#[tracing::instrument(skip(exec, x, config), fields(n = x.len()))]
pub fn nrm2(exec: &Dispatcher, x: &mut MemoryHandle, config: &RunConfig) -> Result<f64> {
    let output = exec.run(Kernel::dot_self(x), config)?;
    let sum_of_squares = output.scalar().ok_or_else(|| {
        BackendError::execution_error(BackendKind::HostSequential, "dot completed without a scalar result")
    })?;
    Ok(sum_of_squares.sqrt())
}

/// `y = A · x` with `A` row-major `rows × cols`.
#[tracing::instrument(skip(exec, a, x, y, config), fields(rows = shape.rows, cols = shape.cols))]
pub fn matvec(
    exec: &Dispatcher,
    a: &mut MemoryHandle,
    shape: MatrixShape,
    x: &mut MemoryHandle,
    y: &mut MemoryHandle,
    config: &RunConfig,
) -> Result<()> {
    exec.run(Kernel::matvec(a, shape, x, y), config)?;
    Ok(())
}
