//! Multi-threaded host backend over a fixed rayon pool

use super::HostOperands;
use crate::backend::{BackendCapabilities, BackendKind, ExecutionBackend, ExecutionHints, ResidencyRequirement};
use crate::error::{BackendError, Result};
use crate::kernel::{axpy_self_slice, axpy_slice, dot_slice, matvec_rows, pairwise_sum, scal_slice, Kernel, KernelOutput};
use offload_tracing::perf_span;
use offload_tracing::performance::record_flops;
use rayon::prelude::*;
use std::fmt;

/// Elements per chunk when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Splits each kernel into contiguous chunks and runs them on a private
/// worker pool.
///
/// Element-wise kernels match [`HostSequentialBackend`](super::HostSequentialBackend)
/// exactly. `dot` sums each chunk left to right and combines the partial
/// sums pairwise in chunk order; the chunking depends only on the input
/// length, so repeated runs return identical bits.
pub struct HostParallelBackend {
    pool: rayon::ThreadPool,
    chunk_size: usize,
}

impl HostParallelBackend {
    /// `threads == 0` uses the available parallelism.
    pub fn new(threads: usize, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(BackendError::execution_error(
                BackendKind::HostParallel,
                "chunk size must be at least 1",
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("offload-host-{index}"))
            .build()
            .map_err(|err| BackendError::execution_error(BackendKind::HostParallel, err))?;

        tracing::debug!(threads = pool.current_num_threads(), chunk_size, "host_parallel_pool_created");
        Ok(Self { pool, chunk_size })
    }

    pub fn with_default_threads() -> Result<Self> {
        Self::new(0, DEFAULT_CHUNK_SIZE)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn run(&self, operands: HostOperands<'_>) -> KernelOutput {
        let chunk = self.chunk_size;
        self.pool.install(|| match operands {
            HostOperands::Axpy { alpha, x, y } => {
                y.par_chunks_mut(chunk)
                    .zip(x.par_chunks(chunk))
                    .for_each(|(ys, xs)| axpy_slice(alpha, xs, ys));
                KernelOutput::Updated
            }
            HostOperands::AxpySelf { alpha, y } => {
                y.par_chunks_mut(chunk).for_each(|ys| axpy_self_slice(alpha, ys));
                KernelOutput::Updated
            }
            HostOperands::Scal { alpha, x } => {
                x.par_chunks_mut(chunk).for_each(|xs| scal_slice(alpha, xs));
                KernelOutput::Updated
            }
            HostOperands::Dot { x, y } => {
                let partials: Vec<f64> = x
                    .par_chunks(chunk)
                    .zip(y.par_chunks(chunk))
                    .map(|(xs, ys)| dot_slice(xs, ys))
                    .collect();
                KernelOutput::Scalar(pairwise_sum(&partials))
            }
            HostOperands::Matvec { a, cols, x, y } => {
                let rows_per_chunk = (chunk / cols.max(1)).max(1);
                y.par_chunks_mut(rows_per_chunk)
                    .enumerate()
                    .for_each(|(index, ys)| matvec_rows(a, cols, x, index * rows_per_chunk, ys));
                KernelOutput::Updated
            }
        })
    }
}

impl fmt::Debug for HostParallelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostParallelBackend")
            .field("threads", &self.threads())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl ExecutionBackend for HostParallelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HostParallel
    }

    fn name(&self) -> &str {
        BackendKind::HostParallel.as_str()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            kind: BackendKind::HostParallel,
            required_residency: ResidencyRequirement::Host,
            supports_async: false,
            deterministic_reduction: true,
            worker_count: self.threads(),
        }
    }

    fn execute(&self, kernel: &mut Kernel<'_>, _hints: &ExecutionHints) -> Result<KernelOutput> {
        kernel.validate()?;
        let name = kernel.name();
        let flops = kernel.flops();
        let span = perf_span!("host_parallel_execute", kernel = name, chunk_size = self.chunk_size);

        let output = self.run(HostOperands::borrow(kernel)?);

        record_flops(name, flops, span.elapsed_us());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::HostSequentialBackend;
    use crate::kernel::MatrixShape;
    use crate::memory::MemoryHandle;
    use proptest::prelude::*;

    fn backend(chunk_size: usize) -> HostParallelBackend {
        HostParallelBackend::new(4, chunk_size).unwrap()
    }

    fn ramp(n: usize, scale: f64) -> Vec<f64> {
        (0..n).map(|i| (i as f64 * scale).sin()).collect()
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(HostParallelBackend::new(2, 0).is_err());
    }

    #[test]
    fn capabilities_report_pool_size() {
        let backend = backend(16);
        assert_eq!(backend.capabilities().worker_count, 4);
        assert_eq!(backend.capabilities().required_residency, ResidencyRequirement::Host);
    }

    #[test]
    fn axpy_spanning_many_chunks() {
        let n = 1000;
        let mut x = MemoryHandle::from_vec(ramp(n, 0.1));
        let mut y = MemoryHandle::from_vec(ramp(n, 0.3));
        let mut expected = y.to_vec().unwrap();
        axpy_slice(1.5, &x.to_vec().unwrap(), &mut expected);

        backend(7)
            .execute(&mut Kernel::axpy(1.5, &mut x, &mut y), &ExecutionHints::default())
            .unwrap();
        assert_eq!(y.to_vec().unwrap(), expected);
    }

    #[test]
    fn self_operand_forms_match_sequential() {
        let n = 2000;
        let hints = ExecutionHints::default();
        let mut par = MemoryHandle::from_vec(ramp(n, 0.05));
        let mut seq = MemoryHandle::from_vec(ramp(n, 0.05));

        backend(97).execute(&mut Kernel::axpy_self(0.75, &mut par), &hints).unwrap();
        HostSequentialBackend
            .execute(&mut Kernel::axpy_self(0.75, &mut seq), &hints)
            .unwrap();
        assert_eq!(par.to_vec().unwrap(), seq.to_vec().unwrap());

        let p = backend(97).execute(&mut Kernel::dot_self(&mut par), &hints).unwrap().scalar().unwrap();
        let s = HostSequentialBackend
            .execute(&mut Kernel::dot_self(&mut seq), &hints)
            .unwrap()
            .scalar()
            .unwrap();
        assert!((p - s).abs() <= 1e-9 * s.abs());
    }

    #[test]
    fn dot_is_bit_reproducible() {
        let n = 10_007;
        let mut x = MemoryHandle::from_vec(ramp(n, 0.01));
        let mut y = MemoryHandle::from_vec(ramp(n, 0.02));
        let backend = backend(64);
        let hints = ExecutionHints::default();

        let first = backend.execute(&mut Kernel::dot(&mut x, &mut y), &hints).unwrap();
        for _ in 0..5 {
            let again = backend.execute(&mut Kernel::dot(&mut x, &mut y), &hints).unwrap();
            assert_eq!(
                first.scalar().map(f64::to_bits),
                again.scalar().map(f64::to_bits)
            );
        }
    }

    #[test]
    fn matvec_matches_sequential() {
        let (rows, cols) = (37, 11);
        let mut a = MemoryHandle::from_vec(ramp(rows * cols, 0.07));
        let mut x = MemoryHandle::from_vec(ramp(cols, 0.5));
        let mut y_par = MemoryHandle::create(rows).unwrap();
        let mut y_seq = MemoryHandle::create(rows).unwrap();
        let shape = MatrixShape::new(rows, cols);
        let hints = ExecutionHints::default();

        backend(20)
            .execute(&mut Kernel::matvec(&mut a, shape, &mut x, &mut y_par), &hints)
            .unwrap();
        HostSequentialBackend
            .execute(&mut Kernel::matvec(&mut a, shape, &mut x, &mut y_seq), &hints)
            .unwrap();
        assert_eq!(y_par.to_vec().unwrap(), y_seq.to_vec().unwrap());
    }

    proptest! {
        #[test]
        fn axpy_agrees_with_sequential(
            values in prop::collection::vec((-1.0e3f64..1.0e3, -1.0e3f64..1.0e3), 0..2000),
            alpha in -10.0f64..10.0,
            chunk in 1usize..300,
        ) {
            let (xs, ys): (Vec<f64>, Vec<f64>) = values.into_iter().unzip();
            let mut x = MemoryHandle::from_vec(xs);
            let mut y_par = MemoryHandle::from_vec(ys.clone());
            let mut y_seq = MemoryHandle::from_vec(ys);
            let hints = ExecutionHints::default();

            backend(chunk).execute(&mut Kernel::axpy(alpha, &mut x, &mut y_par), &hints).unwrap();
            HostSequentialBackend.execute(&mut Kernel::axpy(alpha, &mut x, &mut y_seq), &hints).unwrap();

            for (p, s) in y_par.to_vec().unwrap().iter().zip(y_seq.to_vec().unwrap()) {
                prop_assert!((p - s).abs() <= 1e-9 * s.abs().max(1.0));
            }
        }

        #[test]
        fn dot_within_tolerance_of_sequential(
            values in prop::collection::vec((-1.0f64..1.0, -1.0f64..1.0), 1..3000),
            chunk in 1usize..500,
        ) {
            let (xs, ys): (Vec<f64>, Vec<f64>) = values.into_iter().unzip();
            let magnitude: f64 = xs.iter().zip(&ys).map(|(a, b)| (a * b).abs()).sum();
            let mut x = MemoryHandle::from_vec(xs);
            let mut y = MemoryHandle::from_vec(ys);
            let hints = ExecutionHints::default();

            let par = backend(chunk).execute(&mut Kernel::dot(&mut x, &mut y), &hints).unwrap().scalar().unwrap();
            let seq = HostSequentialBackend.execute(&mut Kernel::dot(&mut x, &mut y), &hints).unwrap().scalar().unwrap();
            prop_assert!((par - seq).abs() <= 1e-12 * magnitude.max(1.0) * 16.0);
        }
    }
}
