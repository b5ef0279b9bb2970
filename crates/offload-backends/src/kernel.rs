//! Kernel descriptors and the arithmetic every backend shares
//!
//! A [`Kernel`] names an operation, borrows its operand handles for the
//! duration of one call and carries its scalar parameters. Operands are
//! borrowed mutably because running a kernel may migrate them; an input
//! handle's values are never changed.
//!
//! | kernel   | operands        | precondition                               | effect                 |
//! |----------|-----------------|--------------------------------------------|------------------------|
//! | `axpy`   | `x`, `y`        | `len(x) == len(y)`                         | `y[i] = a*x[i] + y[i]` |
//! | `scal`   | `x`             | none                                       | `x[i] = a*x[i]`        |
//! | `dot`    | `x`, `y`        | `len(x) == len(y)`                         | returns `Σ x[i]*y[i]`  |
//! | `matvec` | `A`, `x`, `y`   | `len(A) == rows*cols`, `cols == len(x)`, `rows == len(y)` | `y = A·x` |
//!
//! `axpy_self` and `dot_self` read one handle for both vector operands
//! (`y = a*y + y`, `Σ x[i]*x[i]`); it is staged and borrowed once.

use crate::error::{BackendError, Result};
use crate::memory::MemoryHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Row-major dimensions of a matrix operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatrixShape {
    pub rows: usize,
    pub cols: usize,
}

impl MatrixShape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Element count, `None` on overflow.
    pub fn elements(&self) -> Option<usize> {
        self.rows.checked_mul(self.cols)
    }
}

impl fmt::Display for MatrixShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Whether an operand is only read or is written by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandRole {
    Input,
    Output,
}

/// Result of a completed kernel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum KernelOutput {
    /// Output handles were updated in place.
    Updated,
    /// A reduction result.
    Scalar(f64),
}

impl KernelOutput {
    pub fn scalar(self) -> Option<f64> {
        match self {
            Self::Scalar(value) => Some(value),
            Self::Updated => None,
        }
    }
}

/// One kernel invocation.
pub enum Kernel<'a> {
    /// `x: None` reads `y` as the input too.
    Axpy {
        alpha: f64,
        x: Option<&'a mut MemoryHandle>,
        y: &'a mut MemoryHandle,
    },
    Scal {
        alpha: f64,
        x: &'a mut MemoryHandle,
    },
    /// `y: None` is the self product `x·x`.
    Dot {
        x: &'a mut MemoryHandle,
        y: Option<&'a mut MemoryHandle>,
    },
    Matvec {
        a: &'a mut MemoryHandle,
        shape: MatrixShape,
        x: &'a mut MemoryHandle,
        y: &'a mut MemoryHandle,
    },
}

impl<'a> Kernel<'a> {
    pub fn axpy(alpha: f64, x: &'a mut MemoryHandle, y: &'a mut MemoryHandle) -> Self {
        Self::Axpy { alpha, x: Some(x), y }
    }

    /// `y = alpha * y + y`.
    pub fn axpy_self(alpha: f64, y: &'a mut MemoryHandle) -> Self {
        Self::Axpy { alpha, x: None, y }
    }

    pub fn scal(alpha: f64, x: &'a mut MemoryHandle) -> Self {
        Self::Scal { alpha, x }
    }

    pub fn dot(x: &'a mut MemoryHandle, y: &'a mut MemoryHandle) -> Self {
        Self::Dot { x, y: Some(y) }
    }

    /// `Σ x[i] * x[i]`.
    pub fn dot_self(x: &'a mut MemoryHandle) -> Self {
        Self::Dot { x, y: None }
    }

    pub fn matvec(a: &'a mut MemoryHandle, shape: MatrixShape, x: &'a mut MemoryHandle, y: &'a mut MemoryHandle) -> Self {
        Self::Matvec { a, shape, x, y }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Axpy { .. } => "axpy",
            Self::Scal { .. } => "scal",
            Self::Dot { .. } => "dot",
            Self::Matvec { .. } => "matvec",
        }
    }

    /// Check operand lengths. Called before any migration or execution.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Axpy { x: Some(x), y, .. } => check_equal_lengths("axpy", x, y),
            Self::Dot { x, y: Some(y) } => check_equal_lengths("dot", x, y),
            Self::Axpy { x: None, .. } | Self::Dot { y: None, .. } | Self::Scal { .. } => Ok(()),
            Self::Matvec { a, shape, x, y } => {
                let elements = shape
                    .elements()
                    .ok_or_else(|| BackendError::shape_mismatch("matvec", format!("matrix shape {shape} overflows")))?;
                if a.len() != elements {
                    return Err(BackendError::shape_mismatch(
                        "matvec",
                        format!("len(A)={} but shape {shape} needs {elements}", a.len()),
                    ));
                }
                if x.len() != shape.cols {
                    return Err(BackendError::shape_mismatch(
                        "matvec",
                        format!("len(x)={} but A has {} columns", x.len(), shape.cols),
                    ));
                }
                if y.len() != shape.rows {
                    return Err(BackendError::shape_mismatch(
                        "matvec",
                        format!("len(y)={} but A has {} rows", y.len(), shape.rows),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Number of independent work items (lanes) the kernel spans.
    pub fn work_items(&self) -> usize {
        match self {
            Self::Axpy { y, .. } => y.len(),
            Self::Scal { x, .. } => x.len(),
            Self::Dot { x, .. } => x.len(),
            Self::Matvec { shape, .. } => shape.rows,
        }
    }

    /// Length of the largest operand; drives backend auto-selection.
    pub fn largest_operand(&self) -> usize {
        self.operands().iter().map(|(handle, _)| handle.len()).max().unwrap_or(0)
    }

    /// Floating-point operations performed.
    pub fn flops(&self) -> usize {
        match self {
            Self::Axpy { y, .. } => 2 * y.len(),
            Self::Scal { x, .. } => x.len(),
            Self::Dot { x, .. } => 2 * x.len(),
            Self::Matvec { shape, .. } => 2 * shape.rows * shape.cols,
        }
    }

    /// Total device bytes needed to hold every operand.
    pub fn footprint_bytes(&self) -> usize {
        self.operands().iter().map(|(handle, _)| handle.size_bytes()).sum()
    }

    pub fn operands(&self) -> Vec<(&MemoryHandle, OperandRole)> {
        match self {
            Self::Axpy { x: Some(x), y, .. } => vec![(&**x, OperandRole::Input), (&**y, OperandRole::Output)],
            Self::Axpy { x: None, y, .. } => vec![(&**y, OperandRole::Output)],
            Self::Scal { x, .. } => vec![(&**x, OperandRole::Output)],
            Self::Dot { x, y: Some(y) } => vec![(&**x, OperandRole::Input), (&**y, OperandRole::Input)],
            Self::Dot { x, y: None } => vec![(&**x, OperandRole::Input)],
            Self::Matvec { a, x, y, .. } => vec![
                (&**a, OperandRole::Input),
                (&**x, OperandRole::Input),
                (&**y, OperandRole::Output),
            ],
        }
    }

    pub fn operands_mut(&mut self) -> Vec<(&mut MemoryHandle, OperandRole)> {
        match self {
            Self::Axpy { x: Some(x), y, .. } => {
                vec![(&mut **x, OperandRole::Input), (&mut **y, OperandRole::Output)]
            }
            Self::Axpy { x: None, y, .. } => vec![(&mut **y, OperandRole::Output)],
            Self::Scal { x, .. } => vec![(&mut **x, OperandRole::Output)],
            Self::Dot { x, y: Some(y) } => vec![(&mut **x, OperandRole::Input), (&mut **y, OperandRole::Input)],
            Self::Dot { x, y: None } => vec![(&mut **x, OperandRole::Input)],
            Self::Matvec { a, x, y, .. } => vec![
                (&mut **a, OperandRole::Input),
                (&mut **x, OperandRole::Input),
                (&mut **y, OperandRole::Output),
            ],
        }
    }
}

impl fmt::Debug for Kernel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Kernel");
        out.field("name", &self.name());
        match self {
            Self::Axpy { alpha, .. } | Self::Scal { alpha, .. } => {
                out.field("alpha", alpha);
            }
            Self::Matvec { shape, .. } => {
                out.field("shape", shape);
            }
            Self::Dot { .. } => {}
        }
        out.field("operands", &self.operands()).finish()
    }
}

fn check_equal_lengths(operation: &'static str, x: &MemoryHandle, y: &MemoryHandle) -> Result<()> {
    if x.len() != y.len() {
        return Err(BackendError::shape_mismatch(
            operation,
            format!("len(x)={} != len(y)={}", x.len(), y.len()),
        ));
    }
    Ok(())
}

// ============================================================================
// Shared arithmetic
// ============================================================================

/// `y[i] = alpha * x[i] + y[i]` over equal-length slices.
#[inline]
pub fn axpy_slice(alpha: f64, x: &[f64], y: &mut [f64]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi = alpha * xi + *yi;
    }
}

/// `y[i] = alpha * y[i] + y[i]`, the aliased form of [`axpy_slice`].
#[inline]
pub fn axpy_self_slice(alpha: f64, y: &mut [f64]) {
    for yi in y {
        *yi = alpha * *yi + *yi;
    }
}

/// `x[i] = alpha * x[i]`.
#[inline]
pub fn scal_slice(alpha: f64, x: &mut [f64]) {
    for xi in x {
        *xi *= alpha;
    }
}

/// Left-to-right dot product; the canonical reduction order.
#[inline]
pub fn dot_slice(x: &[f64], y: &[f64]) -> f64 {
    debug_assert_eq!(x.len(), y.len());
    x.iter().zip(y).fold(0.0, |acc, (a, b)| acc + a * b)
}

/// Rows `first_row..first_row + y.len()` of `A·x` for a row-major `a` with
/// `cols` columns.
#[inline]
pub fn matvec_rows(a: &[f64], cols: usize, x: &[f64], first_row: usize, y: &mut [f64]) {
    for (offset, yi) in y.iter_mut().enumerate() {
        let start = (first_row + offset) * cols;
        *yi = dot_slice(&a[start..start + cols], x);
    }
}

/// Combine partial sums by recursive halving.
///
/// The combination tree depends only on `partials.len()`, so a fixed
/// partitioning gives bit-identical results run to run.
pub fn pairwise_sum(partials: &[f64]) -> f64 {
    match partials.len() {
        0 => 0.0,
        1 => partials[0],
        2 => partials[0] + partials[1],
        n => {
            let (left, right) = partials.split_at(n / 2);
            pairwise_sum(left) + pairwise_sum(right)
        }
    }
}
