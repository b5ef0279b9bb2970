//! Device-offload backend
//!
//! Launches run on the device context's own execution units against
//! device-resident buffers. A launch is split into blocks of
//! `block_size` lanes:
//!
//! ```text
//! launch(kernel)
//!   ├── validate shapes, block size, device state    (errors: nothing touched)
//!   ├── snapshot operand buffers + output epoch       (LaunchPlan, 'static)
//!   └── spawn on device units ──► blocks compute into scratch
//!                                   └── commit scratch if epoch unchanged
//! ```
//!
//! The output buffer is replaced in one step at the end, so a launch that
//! fails, is cancelled or is fenced off never leaves partial results.

pub mod memory;

pub use memory::{DeviceBuffer, DeviceConfig, DeviceContext};

use crate::backend::{
    BackendCapabilities, BackendKind, CompletionToken, Completer, ExecutionBackend, ExecutionHints, LaunchConfig,
    Residency, ResidencyRequirement,
};
use crate::error::{BackendError, Result};
use crate::kernel::{axpy_self_slice, axpy_slice, dot_slice, matvec_rows, pairwise_sum, scal_slice, Kernel, KernelOutput};
use crate::memory::{HandleId, MemoryHandle};
use offload_tracing::performance::{record_flops, record_launch};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

/// Lanes per block when the caller gives no hint.
pub const DEFAULT_BLOCK_SIZE: u32 = 256;

/// Executes kernels asynchronously on a [`DeviceContext`].
#[derive(Debug, Clone)]
pub struct DeviceOffloadBackend {
    context: Arc<DeviceContext>,
    default_block_size: u32,
}

impl DeviceOffloadBackend {
    pub fn new(context: Arc<DeviceContext>) -> Self {
        let default_block_size = DEFAULT_BLOCK_SIZE.min(context.max_lanes_per_block()).max(1);
        Self {
            context,
            default_block_size,
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.default_block_size = block_size;
        self
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    fn launch_config(&self, kernel: &Kernel<'_>, hints: &ExecutionHints) -> Result<LaunchConfig> {
        let block_size = hints.block_size.unwrap_or(self.default_block_size);
        let max = self.context.max_lanes_per_block();
        if block_size == 0 || block_size > max {
            return Err(BackendError::execution_error(
                BackendKind::DeviceOffload,
                format!("invalid launch configuration: block size {block_size} outside 1..={max}"),
            ));
        }
        Ok(LaunchConfig::linear(kernel.work_items(), block_size))
    }

    fn input(&self, handle: &MemoryHandle) -> Result<DeviceBuffer> {
        let buffer = handle.device_buffer()?;
        if !buffer.is_on(&self.context) {
            return Err(BackendError::unsupported_residency(
                handle.residency(),
                format!("handle {} lives on device {}", handle.id(), buffer.context().name()),
            ));
        }
        Ok(buffer.clone())
    }

    fn output(&self, handle: &MemoryHandle) -> Result<PlanOutput> {
        if handle.residency() == Residency::Mirrored {
            return Err(BackendError::unsupported_residency(
                Residency::Mirrored,
                format!("output handle {} must be device-only before a launch", handle.id()),
            ));
        }
        let buffer = self.input(handle)?;
        Ok(PlanOutput {
            handle: handle.id(),
            epoch: buffer.epoch(),
            buffer,
        })
    }

    fn plan(&self, kernel: &Kernel<'_>, config: LaunchConfig) -> Result<LaunchPlan> {
        let op = match kernel {
            Kernel::Axpy { alpha, x: Some(x), y } => PlanOp::Axpy {
                alpha: *alpha,
                x: self.input(x)?,
                y: self.output(y)?,
            },
            Kernel::Axpy { alpha, x: None, y } => PlanOp::AxpySelf {
                alpha: *alpha,
                y: self.output(y)?,
            },
            Kernel::Scal { alpha, x } => PlanOp::Scal {
                alpha: *alpha,
                x: self.output(x)?,
            },
            Kernel::Dot { x, y } => PlanOp::Dot {
                x: self.input(x)?,
                y: y.as_deref().map(|y| self.input(y)).transpose()?,
            },
            Kernel::Matvec { a, shape, x, y } => PlanOp::Matvec {
                a: self.input(a)?,
                cols: shape.cols,
                x: self.input(x)?,
                y: self.output(y)?,
            },
        };
        Ok(LaunchPlan {
            kernel: kernel.name(),
            flops: kernel.flops(),
            config,
            context: Arc::clone(&self.context),
            op,
        })
    }
}

impl ExecutionBackend for DeviceOffloadBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DeviceOffload
    }

    fn name(&self) -> &str {
        self.context.name()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            kind: BackendKind::DeviceOffload,
            required_residency: ResidencyRequirement::Device,
            supports_async: true,
            deterministic_reduction: true,
            worker_count: self.context.compute_units(),
        }
    }

    fn device(&self) -> Option<&Arc<DeviceContext>> {
        Some(&self.context)
    }

    fn execute(&self, kernel: &mut Kernel<'_>, hints: &ExecutionHints) -> Result<KernelOutput> {
        self.launch(kernel, hints)?.wait()
    }

    fn launch(&self, kernel: &mut Kernel<'_>, hints: &ExecutionHints) -> Result<CompletionToken> {
        kernel.validate()?;
        if self.context.is_lost() {
            return Err(BackendError::execution_error(
                BackendKind::DeviceOffload,
                format!("device {} is lost", self.context.name()),
            ));
        }
        let config = self.launch_config(kernel, hints)?;
        let plan = self.plan(kernel, config)?;

        let (token, completer) = CompletionToken::pending(plan.kernel);
        tracing::debug!(
            kernel = plan.kernel,
            device = self.context.name(),
            grid = %config.grid,
            block = %config.block,
            "device_launch_submitted"
        );
        self.context.units().spawn(move || plan.run(completer));
        Ok(token)
    }
}

struct PlanOutput {
    handle: HandleId,
    buffer: DeviceBuffer,
    /// Epoch observed at submission; the commit fails if it moved.
    epoch: u64,
}

enum PlanOp {
    Axpy { alpha: f64, x: DeviceBuffer, y: PlanOutput },
    AxpySelf { alpha: f64, y: PlanOutput },
    Scal { alpha: f64, x: PlanOutput },
    /// `y: None` reads `x` under a single lock.
    Dot { x: DeviceBuffer, y: Option<DeviceBuffer> },
    Matvec {
        a: DeviceBuffer,
        cols: usize,
        x: DeviceBuffer,
        y: PlanOutput,
    },
}

/// Owned snapshot of a launch that can outlive the caller's borrows.
struct LaunchPlan {
    kernel: &'static str,
    flops: usize,
    config: LaunchConfig,
    context: Arc<DeviceContext>,
    op: PlanOp,
}

impl LaunchPlan {
    fn run(self, completer: Completer) {
        if completer.is_cancelled() {
            tracing::debug!(kernel = self.kernel, "device_launch_cancelled_before_start");
            completer.complete(Err(BackendError::Cancelled { kernel: self.kernel }));
            return;
        }

        let start = Instant::now();
        let result = self.compute_and_commit(&completer);
        let duration_us = start.elapsed().as_micros() as u64;

        record_launch(
            self.kernel,
            self.config.grid.total_blocks(),
            self.config.block.total_lanes(),
            duration_us,
        );
        if result.is_ok() {
            record_flops(self.kernel, self.flops, duration_us);
        }
        completer.complete(result);
    }

    fn compute_and_commit(&self, completer: &Completer) -> Result<KernelOutput> {
        let block = self.config.lanes_per_block();
        match &self.op {
            PlanOp::Axpy { alpha, x, y } => {
                let mut scratch = y.buffer.read().values.clone();
                {
                    let x = x.read();
                    scratch
                        .par_chunks_mut(block)
                        .zip(x.values.par_chunks(block))
                        .for_each(|(ys, xs)| axpy_slice(*alpha, xs, ys));
                }
                self.commit(completer, y, scratch)
            }
            PlanOp::AxpySelf { alpha, y } => {
                let mut scratch = y.buffer.read().values.clone();
                scratch
                    .par_chunks_mut(block)
                    .for_each(|ys| axpy_self_slice(*alpha, ys));
                self.commit(completer, y, scratch)
            }
            PlanOp::Scal { alpha, x } => {
                let mut scratch = x.buffer.read().values.clone();
                scratch.par_chunks_mut(block).for_each(|xs| scal_slice(*alpha, xs));
                self.commit(completer, x, scratch)
            }
            PlanOp::Dot { x, y } => {
                let x = x.read();
                let y = y.as_ref().map(DeviceBuffer::read);
                let ys = y.as_ref().map_or(x.values.as_slice(), |y| y.values.as_slice());
                let partials: Vec<f64> = x
                    .values
                    .par_chunks(block)
                    .zip(ys.par_chunks(block))
                    .map(|(xs, ys)| dot_slice(xs, ys))
                    .collect();
                self.check_live(completer)?;
                Ok(KernelOutput::Scalar(pairwise_sum(&partials)))
            }
            PlanOp::Matvec { a, cols, x, y } => {
                let mut scratch = vec![0.0; y.buffer.len()];
                {
                    let a = a.read();
                    let x = x.read();
                    let (a, x) = (a.values.as_slice(), x.values.as_slice());
                    scratch
                        .par_chunks_mut(block)
                        .enumerate()
                        .for_each(|(index, ys)| matvec_rows(a, *cols, x, index * block, ys));
                }
                self.commit(completer, y, scratch)
            }
        }
    }

    fn check_live(&self, completer: &Completer) -> Result<()> {
        if completer.is_cancelled() {
            return Err(BackendError::Cancelled { kernel: self.kernel });
        }
        if self.context.is_lost() {
            return Err(BackendError::execution_error(
                BackendKind::DeviceOffload,
                format!("device {} lost during {}", self.context.name(), self.kernel),
            ));
        }
        Ok(())
    }

    fn commit(&self, completer: &Completer, output: &PlanOutput, scratch: Vec<f64>) -> Result<KernelOutput> {
        self.check_live(completer)?;
        match output.buffer.commit(output.epoch, scratch) {
            Ok(_) => Ok(KernelOutput::Updated),
            Err(found) => {
                tracing::warn!(
                    kernel = self.kernel,
                    handle = %output.handle,
                    expected = output.epoch,
                    found,
                    "device_commit_rejected"
                );
                Err(BackendError::ConcurrentMutation {
                    handle: output.handle,
                    expected: output.epoch,
                    found,
                })
            }
        }
    }
}
