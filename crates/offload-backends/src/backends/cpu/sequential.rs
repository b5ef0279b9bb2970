//! Single-threaded reference backend

use super::HostOperands;
use crate::backend::{BackendCapabilities, BackendKind, ExecutionBackend, ExecutionHints, ResidencyRequirement};
use crate::error::Result;
use crate::kernel::{axpy_self_slice, axpy_slice, dot_slice, matvec_rows, scal_slice, Kernel, KernelOutput};
use offload_tracing::perf_span;
use offload_tracing::performance::record_flops;

/// Executes every kernel on the calling thread in ascending index order.
///
/// Its results define correctness for the other backends; `dot` is a plain
/// left-to-right sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSequentialBackend;

impl HostSequentialBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ExecutionBackend for HostSequentialBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HostSequential
    }

    fn name(&self) -> &str {
        BackendKind::HostSequential.as_str()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            kind: BackendKind::HostSequential,
            required_residency: ResidencyRequirement::Host,
            supports_async: false,
            deterministic_reduction: true,
            worker_count: 1,
        }
    }

    fn execute(&self, kernel: &mut Kernel<'_>, _hints: &ExecutionHints) -> Result<KernelOutput> {
        kernel.validate()?;
        let name = kernel.name();
        let flops = kernel.flops();
        let span = perf_span!("host_sequential_execute", kernel = name);

        let output = match HostOperands::borrow(kernel)? {
            HostOperands::Axpy { alpha, x, y } => {
                axpy_slice(alpha, x, y);
                KernelOutput::Updated
            }
            HostOperands::AxpySelf { alpha, y } => {
                axpy_self_slice(alpha, y);
                KernelOutput::Updated
            }
            HostOperands::Scal { alpha, x } => {
                scal_slice(alpha, x);
                KernelOutput::Updated
            }
            HostOperands::Dot { x, y } => KernelOutput::Scalar(dot_slice(x, y)),
            HostOperands::Matvec { a, cols, x, y } => {
                matvec_rows(a, cols, x, 0, y);
                KernelOutput::Updated
            }
        };

        record_flops(name, flops, span.elapsed_us());
        Ok(output)
    }
}
