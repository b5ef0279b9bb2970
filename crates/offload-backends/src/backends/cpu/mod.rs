//! Host backends
//!
//! Both backends read and write handle host memory in place and require
//! host-valid operands.
//!
//! # Architecture
//!
//! ```text
//! Kernel ──► HostOperands (borrowed slices)
//!                 │
//!      ┌──────────┴───────────┐
//!      ▼                      ▼
//! HostSequentialBackend   HostParallelBackend
//!  ascending index         contiguous chunks on a fixed
//!  order, one thread       rayon pool, in-order pairwise
//!                          reduction of partial sums
//! ```

mod parallel;
mod sequential;

pub use parallel::{HostParallelBackend, DEFAULT_CHUNK_SIZE};
pub use sequential::HostSequentialBackend;

use crate::error::Result;
use crate::kernel::Kernel;

/// Host slices of a kernel's operands, borrowed for one execution.
pub(crate) enum HostOperands<'k> {
    Axpy {
        alpha: f64,
        x: &'k [f64],
        y: &'k mut [f64],
    },
    AxpySelf {
        alpha: f64,
        y: &'k mut [f64],
    },
    Scal {
        alpha: f64,
        x: &'k mut [f64],
    },
    Dot {
        x: &'k [f64],
        y: &'k [f64],
    },
    Matvec {
        a: &'k [f64],
        cols: usize,
        x: &'k [f64],
        y: &'k mut [f64],
    },
}

impl<'k> HostOperands<'k> {
    /// Borrow host views of every operand.
    ///
    /// Inputs are checked before the output is opened for writing, so a
    /// residency error leaves every handle unchanged.
    pub(crate) fn borrow(kernel: &'k mut Kernel<'_>) -> Result<Self> {
        Ok(match kernel {
            Kernel::Axpy { alpha, x: Some(x), y } => {
                let x = x.as_slice()?;
                Self::Axpy {
                    alpha: *alpha,
                    x,
                    y: y.host_view_mut()?,
                }
            }
            Kernel::Axpy { alpha, x: None, y } => Self::AxpySelf {
                alpha: *alpha,
                y: y.host_view_mut()?,
            },
            Kernel::Scal { alpha, x } => Self::Scal {
                alpha: *alpha,
                x: x.host_view_mut()?,
            },
            Kernel::Dot { x, y } => {
                let x = x.as_slice()?;
                let y = match y {
                    Some(y) => y.as_slice()?,
                    None => x,
                };
                Self::Dot { x, y }
            }
            Kernel::Matvec { a, shape, x, y } => {
                let a = a.as_slice()?;
                let x = x.as_slice()?;
                Self::Matvec {
                    a,
                    cols: shape.cols,
                    x,
                    y: y.host_view_mut()?,
                }
            }
        })
    }
}
