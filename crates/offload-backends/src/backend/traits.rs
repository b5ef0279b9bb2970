//! Backend trait for kernel execution

use super::token::CompletionToken;
use super::types::{BackendCapabilities, BackendKind, ExecutionHints};
use crate::backends::device::DeviceContext;
use crate::error::Result;
use crate::kernel::{Kernel, KernelOutput};
use std::sync::Arc;

/// A concrete strategy for executing kernels.
///
/// ```text
///                 ExecutionBackend
///                        │
///        ┌───────────────┼────────────────┐
///        ▼               ▼                ▼
///  HostSequential   HostParallel    DeviceOffload
///   (1 thread)     (rayon pool)   (device context)
/// ```
///
/// Backends are stateless with respect to individual calls and are shared
/// read-only through the registry, hence `Send + Sync` and `&self`.
///
/// Every backend validates the kernel before touching any output and
/// expects operands to already satisfy
/// [`BackendCapabilities::required_residency`]; it never migrates data
/// itself. Operands at the wrong residency fail with
/// [`BackendError::UnsupportedResidency`](crate::BackendError::UnsupportedResidency).
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Identifier used in logs and diagnostics.
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Device context owning this backend's memory, if any.
    fn device(&self) -> Option<&Arc<DeviceContext>> {
        None
    }

    /// Run `kernel` to completion.
    fn execute(&self, kernel: &mut Kernel<'_>, hints: &ExecutionHints) -> Result<KernelOutput>;

    /// Submit `kernel` and return a token for its completion.
    ///
    /// Synchronous backends run the kernel in place and hand back an
    /// already-resolved token.
    fn launch(&self, kernel: &mut Kernel<'_>, hints: &ExecutionHints) -> Result<CompletionToken> {
        let output = self.execute(kernel, hints)?;
        Ok(CompletionToken::completed(kernel.name(), Ok(output)))
    }
}
