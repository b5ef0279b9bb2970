//! Convenience entry points over [`Dispatcher`](crate::Dispatcher)
//!
//! - [`linalg`] - BLAS-1/2 style kernels (axpy, scal, dot, nrm2, matvec)

pub mod linalg;
