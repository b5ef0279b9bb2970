//! Backend selection and residency coordination
//!
//! ```text
//! Dispatcher::run(kernel, config)
//!   ↓ validate shapes                    (ShapeRejected, nothing touched)
//!   ↓ select backend                     (auto policy / explicit / fallback)
//!   ↓ migrate operands                   (inputs first, then outputs)
//!   ↓ backend.execute / backend.launch
//!   ↓ migrate outputs back to Host
//!   ↓ ExecutionMetrics → tracing + profiler
//! ```
//!
//! Callers never observe device-only outputs after a successful call. The
//! dispatcher holds no per-call state; exclusive access to handles is
//! enforced by the `&mut` borrows inside [`Kernel`].

use crate::config::{BackendChoice, DispatcherConfig, RunConfig};
use crate::diagnostics::{Diagnostic, DiagnosticSink, TracingSink};
use crate::error::{Error, Result};
use crate::instrumentation::{ExecutionMetrics, KernelProfiler};
use crate::registry::BackendRegistry;
use offload_backends::{
    BackendError, BackendKind, CompletionToken, DeviceContext, ExecutionBackend, HostSequentialBackend, Kernel,
    KernelOutput, MemoryHandle, OperandRole, Residency, ResidencyRequirement,
};
use offload_tracing::timed_block;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

static GLOBAL: OnceLock<Dispatcher> = OnceLock::new();

/// Chooses a backend for each kernel and moves data to where it runs.
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: BackendRegistry,
    sink: Arc<dyn DiagnosticSink>,
    profiler: Option<Arc<KernelProfiler>>,
}

/// Result of [`Dispatcher::dispatch`], shaped by `RunConfig::async_mode`.
#[derive(Debug)]
pub enum RunOutcome<'k> {
    Done(KernelOutput),
    Pending(PendingRun<'k>),
}

impl<'k> RunOutcome<'k> {
    /// Wait if pending and return the output.
    pub fn wait(self) -> Result<KernelOutput> {
        match self {
            Self::Done(output) => Ok(output),
            Self::Pending(mut pending) => pending.wait(),
        }
    }
}

/// Backend picked for one call.
struct Selection {
    backend: Arc<dyn ExecutionBackend>,
    fell_back: bool,
}

impl Dispatcher {
    /// Build the registry described by `config`.
    #[tracing::instrument(skip(config))]
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let registry = BackendRegistry::from_config(&config)?;
        Self::with_registry(registry, config)
    }

    /// Use a prepared registry. Host-sequential is added if missing since
    /// every fallback lands there.
    pub fn with_registry(mut registry: BackendRegistry, config: DispatcherConfig) -> Result<Self> {
        config.validate()?;
        if !registry.contains(BackendKind::HostSequential) {
            registry.register(Arc::new(HostSequentialBackend));
        }
        tracing::debug!(backends = ?registry.kinds(), defaults = ?config.defaults, "dispatcher_created");
        Ok(Self {
            config,
            registry,
            sink: Arc::new(TracingSink),
            profiler: None,
        })
    }

    /// Host backends only, default settings.
    pub fn host_only() -> Result<Self> {
        Self::new(DispatcherConfig::host_only())
    }

    /// Configuration from `OFFLOAD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(DispatcherConfig::from_env()?)
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_profiler(mut self, profiler: Arc<KernelProfiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn defaults(&self) -> &RunConfig {
        &self.config.defaults
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn profiler(&self) -> Option<&Arc<KernelProfiler>> {
        self.profiler.as_ref()
    }

    /// Device context of the registered device backend, if any.
    pub fn device(&self) -> Option<&Arc<DeviceContext>> {
        self.registry
            .get(BackendKind::DeviceOffload)
            .and_then(|backend| backend.device())
    }

    /// The backend `config` would pick for `kernel`, without running it.
    ///
    /// Does not report fallback diagnostics.
    pub fn select_backend(&self, kernel: &Kernel<'_>, config: &RunConfig) -> Result<BackendKind> {
        match config.backend.explicit() {
            Some(kind) if self.registry.contains(kind) => Ok(kind),
            Some(_) if config.allow_fallback => Ok(BackendKind::HostSequential),
            Some(kind) => Err(Error::BackendUnavailable { requested: kind }),
            None => Ok(self.auto_select(kernel, config)),
        }
    }

    /// Run with the dispatcher's default [`RunConfig`].
    pub fn run_default(&self, kernel: Kernel<'_>) -> Result<KernelOutput> {
        self.run(kernel, &self.config.defaults)
    }

    /// Run `kernel` to completion. Outputs are host-resident on return.
    ///
    /// `config.async_mode` is ignored here; see [`dispatch`](Self::dispatch).
    #[tracing::instrument(skip(self, kernel, config), fields(kernel = kernel.name(), backend = %config.backend))]
    pub fn run(&self, mut kernel: Kernel<'_>, config: &RunConfig) -> Result<KernelOutput> {
        let start = Instant::now();
        let selection = self.begin(&mut kernel, config)?;
        let kind = selection.backend.kind();

        let (result, execution_us) = timed_block!("backend_execute", {
            selection.backend.execute(&mut kernel, &config.hints())
        });
        let execution = Duration::from_micros(execution_us);

        let result = self.settle(&mut kernel, kind, result);
        if result.is_ok() {
            self.record(&kernel, kind, start, execution, selection.fell_back);
        }
        result.map_err(Error::from)
    }

    /// Submit `kernel` and return without waiting.
    ///
    /// Only the device backend runs asynchronously; the host backends finish
    /// before this returns and hand back an already-completed run.
    #[tracing::instrument(skip(self, kernel, config), fields(kernel = kernel.name(), backend = %config.backend))]
    pub fn run_async<'k>(&self, mut kernel: Kernel<'k>, config: &RunConfig) -> Result<PendingRun<'k>> {
        let start = Instant::now();
        let selection = self.begin(&mut kernel, config)?;
        let backend = selection.backend;
        let kind = backend.kind();

        let token = match backend.launch(&mut kernel, &config.hints()) {
            Ok(token) => token,
            Err(err) => {
                let _ = self.settle(&mut kernel, kind, Err(err.clone()));
                return Err(err.into());
            }
        };

        Ok(PendingRun {
            kernel,
            token,
            backend: kind,
            synchronous: !backend.capabilities().supports_async,
            fell_back: selection.fell_back,
            start,
            submitted: Instant::now(),
            result: None,
            sink: Arc::clone(&self.sink),
            profiler: self.profiler.clone(),
        })
    }

    /// Run or submit depending on `config.async_mode`.
    pub fn dispatch<'k>(&self, kernel: Kernel<'k>, config: &RunConfig) -> Result<RunOutcome<'k>> {
        if config.async_mode {
            self.run_async(kernel, config).map(RunOutcome::Pending)
        } else {
            self.run(kernel, config).map(RunOutcome::Done)
        }
    }

    /// Validate, select and migrate. On error every output is host-resident
    /// (or flagged indeterminate if that failed too).
    fn begin(&self, kernel: &mut Kernel<'_>, config: &RunConfig) -> Result<Selection> {
        if let Err(err) = kernel.validate() {
            self.sink.report(Diagnostic::ShapeRejected {
                kernel: kernel.name(),
                detail: err.to_string(),
            });
            return Err(err.into());
        }

        let selection = self.select(kernel, config)?;
        let kind = selection.backend.kind();
        tracing::debug!(
            kernel = kernel.name(),
            backend = %kind,
            elements = kernel.largest_operand(),
            fell_back = selection.fell_back,
            "backend_selected"
        );

        if let Err(err) = stage_operands(kernel, selection.backend.as_ref()) {
            restore_outputs(kernel);
            self.sink.report(Diagnostic::from_error(kernel.name(), kind, &err));
            return Err(err.into());
        }
        Ok(selection)
    }

    fn select(&self, kernel: &Kernel<'_>, config: &RunConfig) -> Result<Selection> {
        let kind = match config.backend.explicit() {
            Some(kind) => match self.registry.get(kind) {
                Some(backend) => {
                    return Ok(Selection {
                        backend: Arc::clone(backend),
                        fell_back: false,
                    })
                }
                None if config.allow_fallback => {
                    self.sink.report(Diagnostic::Fallback {
                        kernel: kernel.name(),
                        requested: kind,
                        used: BackendKind::HostSequential,
                    });
                    return Ok(Selection {
                        backend: Arc::clone(self.registry.require(BackendKind::HostSequential)?),
                        fell_back: true,
                    });
                }
                None => return Err(Error::BackendUnavailable { requested: kind }),
            },
            None => self.auto_select(kernel, config),
        };
        Ok(Selection {
            backend: Arc::clone(self.registry.require(kind)?),
            fell_back: false,
        })
    }

    /// Large kernels go to the device when it can hold them, else to the
    /// host pool; everything else stays sequential.
    fn auto_select(&self, kernel: &Kernel<'_>, config: &RunConfig) -> BackendKind {
        debug_assert_eq!(config.backend, BackendChoice::Auto);
        if kernel.largest_operand() < config.parallel_threshold {
            return BackendKind::HostSequential;
        }
        if let Some(device) = self.device() {
            if !device.is_lost() && device_bytes_needed(kernel, device) <= device.free_bytes() {
                return BackendKind::DeviceOffload;
            }
        }
        if self.registry.contains(BackendKind::HostParallel) {
            return BackendKind::HostParallel;
        }
        BackendKind::HostSequential
    }

    /// Bring outputs home and report failures.
    fn settle(
        &self,
        kernel: &mut Kernel<'_>,
        backend: BackendKind,
        result: std::result::Result<KernelOutput, BackendError>,
    ) -> std::result::Result<KernelOutput, BackendError> {
        settle_outputs(kernel, backend, result, self.sink.as_ref())
    }

    fn record(&self, kernel: &Kernel<'_>, backend: BackendKind, start: Instant, execution: Duration, fell_back: bool) {
        let metrics = ExecutionMetrics::new(
            kernel.name(),
            backend,
            kernel.largest_operand(),
            kernel.flops(),
            start,
            execution,
        )
        .with_fallback(fell_back);
        metrics.log();
        if let Some(profiler) = &self.profiler {
            profiler.record(&metrics);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("profiling", &self.profiler.is_some())
            .finish()
    }
}

/// Install the process-wide dispatcher. Fails if one is already installed.
pub fn install_global(dispatcher: Dispatcher) -> Result<&'static Dispatcher> {
    let already_installed = || Error::InvalidConfig("a global dispatcher is already installed".to_string());
    GLOBAL.set(dispatcher).map_err(|_| already_installed())?;
    GLOBAL.get().ok_or_else(already_installed)
}

/// The process-wide dispatcher, created from the environment on first use.
pub fn global() -> Result<&'static Dispatcher> {
    if let Some(dispatcher) = GLOBAL.get() {
        return Ok(dispatcher);
    }
    let dispatcher = Dispatcher::from_env()?;
    Ok(GLOBAL.get_or_init(|| dispatcher))
}

/// An asynchronous run that has been submitted but not yet observed.
///
/// Call [`wait`](Self::wait) to block for the result and bring outputs back
/// to the host; it may be called repeatedly. Dropping the run without
/// waiting cancels it, fences its outputs against a late commit and marks
/// them [`Residency::Indeterminate`].
pub struct PendingRun<'k> {
    kernel: Kernel<'k>,
    token: CompletionToken,
    backend: BackendKind,
    synchronous: bool,
    fell_back: bool,
    start: Instant,
    submitted: Instant,
    result: Option<std::result::Result<KernelOutput, BackendError>>,
    sink: Arc<dyn DiagnosticSink>,
    profiler: Option<Arc<KernelProfiler>>,
}

impl<'k> PendingRun<'k> {
    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some() || self.token.is_complete()
    }

    /// Request cancellation; `false` if the launch already finished.
    pub fn cancel(&self) -> bool {
        self.result.is_none() && self.token.cancel()
    }

    /// Block until the run resolves, then migrate outputs to the host.
    pub fn wait(&mut self) -> Result<KernelOutput> {
        if let Some(result) = &self.result {
            return result.clone().map_err(Error::from);
        }
        let result = self.token.wait();
        self.finish(result).map_err(Error::from)
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<KernelOutput>> {
        if let Some(result) = &self.result {
            return Some(result.clone().map_err(Error::from));
        }
        let result = self.token.wait_timeout(timeout)?;
        Some(self.finish(result).map_err(Error::from))
    }

    fn finish(
        &mut self,
        result: std::result::Result<KernelOutput, BackendError>,
    ) -> std::result::Result<KernelOutput, BackendError> {
        let execution = self.submitted.elapsed();
        let result = settle_outputs(&mut self.kernel, self.backend, result, self.sink.as_ref());
        if result.is_ok() {
            let metrics = ExecutionMetrics::new(
                self.kernel.name(),
                self.backend,
                self.kernel.largest_operand(),
                self.kernel.flops(),
                self.start,
                execution,
            )
            .with_fallback(self.fell_back);
            metrics.log();
            if let Some(profiler) = &self.profiler {
                profiler.record(&metrics);
            }
        }
        self.result = Some(result.clone());
        result
    }
}

impl fmt::Debug for PendingRun<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRun")
            .field("kernel", &self.kernel.name())
            .field("backend", &self.backend)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Drop for PendingRun<'_> {
    fn drop(&mut self) {
        if self.result.is_some() {
            return;
        }
        if self.synchronous {
            let result = self.token.wait();
            let _ = self.finish(result);
            return;
        }

        self.token.cancel();
        for (handle, role) in self.kernel.operands_mut() {
            if role == OperandRole::Output {
                handle.abandon_pending_write();
            }
        }
        self.sink.report(Diagnostic::Abandoned {
            kernel: self.kernel.name(),
            backend: self.backend,
        });
    }
}

fn device_bytes_needed(kernel: &Kernel<'_>, device: &Arc<DeviceContext>) -> usize {
    kernel
        .operands()
        .into_iter()
        .filter(|(handle, _)| !on_device(handle, device))
        .map(|(handle, _)| handle.size_bytes())
        .sum()
}

fn on_device(handle: &MemoryHandle, device: &Arc<DeviceContext>) -> bool {
    handle.residency().is_device_valid() && handle.device_context().is_some_and(|ctx| Arc::ptr_eq(ctx, device))
}

/// Move operands to the residency `backend` requires; inputs first so an
/// input failure leaves every output untouched.
///
/// On failure every operand this call already moved is returned to the
/// residency it had before, releasing any device memory it took.
fn stage_operands(kernel: &mut Kernel<'_>, backend: &dyn ExecutionBackend) -> std::result::Result<(), BackendError> {
    let requirement = backend.capabilities().required_residency;
    let device = backend.device();

    let mut operands = kernel.operands_mut();
    operands.sort_by_key(|(_, role)| *role == OperandRole::Output);

    let mut staged: Vec<(&mut MemoryHandle, Residency)> = Vec::with_capacity(operands.len());
    for (handle, role) in operands {
        let is_output = role == OperandRole::Output;
        let satisfied = requirement.is_satisfied_by(handle.residency())
            && match (requirement, device) {
                (ResidencyRequirement::Host, _) => true,
                (ResidencyRequirement::Device, Some(device)) => on_device(handle, device),
                (ResidencyRequirement::Device, None) => false,
            };
        if satisfied && (!is_output || requirement == ResidencyRequirement::Host) {
            continue;
        }

        let before = handle.residency();
        if let Err(err) = handle.migrate(requirement.target(is_output), device) {
            unstage(staged, device);
            return Err(err);
        }
        staged.push((handle, before));
    }
    Ok(())
}

fn unstage(staged: Vec<(&mut MemoryHandle, Residency)>, device: Option<&Arc<DeviceContext>>) {
    for (handle, before) in staged.into_iter().rev() {
        if let Err(err) = handle.migrate(before, device) {
            tracing::warn!(handle = %handle.id(), residency = %before, error = %err, "operand_unstage_failed");
        }
    }
}

/// Best-effort return of every output to the host.
fn restore_outputs(kernel: &mut Kernel<'_>) {
    for (handle, role) in kernel.operands_mut() {
        if role != OperandRole::Output || handle.residency() == Residency::Host {
            continue;
        }
        if let Err(err) = handle.migrate(Residency::Host, None) {
            tracing::warn!(handle = %handle.id(), error = %err, "output_restore_failed");
            handle.abandon_pending_write();
        }
    }
}

fn settle_outputs(
    kernel: &mut Kernel<'_>,
    backend: BackendKind,
    result: std::result::Result<KernelOutput, BackendError>,
    sink: &dyn DiagnosticSink,
) -> std::result::Result<KernelOutput, BackendError> {
    // Outputs are restored on failure too: the device commit is all or nothing.
    restore_outputs(kernel);
    let indeterminate = kernel
        .operands()
        .into_iter()
        .find(|(handle, role)| *role == OperandRole::Output && handle.residency() == Residency::Indeterminate)
        .map(|(handle, _)| handle.id());

    match (result, indeterminate) {
        (Err(err), _) => {
            sink.report(Diagnostic::from_error(kernel.name(), backend, &err));
            Err(err)
        }
        (Ok(_), Some(handle)) => {
            let err = BackendError::Indeterminate { handle };
            sink.report(Diagnostic::from_error(kernel.name(), backend, &err));
            Err(err)
        }
        (Ok(output), None) => {
            tracing::debug!(kernel = kernel.name(), backend = %backend, "kernel_completed");
            Ok(output)
        }
    }
}
