//! Read-only collection of execution backends, keyed by kind

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use offload_backends::{
    BackendKind, DeviceContext, DeviceOffloadBackend, ExecutionBackend, HostParallelBackend, HostSequentialBackend,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Backends available to a dispatcher.
///
/// At most one backend per [`BackendKind`]; registering a kind again
/// replaces the previous entry. The registry is built once and shared
/// read-only afterwards.
///
/// ```rust
/// use offload_core::BackendRegistry;
/// use offload_backends::BackendKind;
///
/// let registry = BackendRegistry::with_host_backends(2, 4096).unwrap();
/// assert!(registry.contains(BackendKind::HostParallel));
/// assert!(!registry.contains(BackendKind::DeviceOffload));
/// ```
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    /// Empty registry. Dispatching still needs host-sequential registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Host-sequential only.
    pub fn sequential_only() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HostSequentialBackend));
        registry
    }

    /// Host-sequential plus a host-parallel pool.
    pub fn with_host_backends(worker_threads: usize, chunk_size: usize) -> Result<Self> {
        let mut registry = Self::sequential_only();
        registry.register(Arc::new(HostParallelBackend::new(worker_threads, chunk_size)?));
        Ok(registry)
    }

    /// Everything `config` describes: host backends and, when configured,
    /// a device-offload backend on a fresh device context.
    pub fn from_config(config: &DispatcherConfig) -> Result<Self> {
        config.validate()?;
        let mut registry = Self::with_host_backends(config.worker_threads, config.chunk_size)?;
        if let Some(device) = &config.device {
            let context = DeviceContext::new(device.clone())?;
            registry.register(Arc::new(DeviceOffloadBackend::new(context)));
        }
        Ok(registry)
    }

    /// Register `backend`, returning the one it replaced.
    pub fn register(&mut self, backend: Arc<dyn ExecutionBackend>) -> Option<Arc<dyn ExecutionBackend>> {
        let kind = backend.kind();
        tracing::debug!(backend = %kind, name = backend.name(), "backend_registered");
        self.backends.insert(kind, backend)
    }

    pub fn get(&self, kind: BackendKind) -> Option<&Arc<dyn ExecutionBackend>> {
        self.backends.get(&kind)
    }

    /// Like [`get`](Self::get) but reports a missing backend as an error.
    pub fn require(&self, kind: BackendKind) -> Result<&Arc<dyn ExecutionBackend>> {
        self.get(kind).ok_or(Error::BackendUnavailable { requested: kind })
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<BackendKind> {
        BackendKind::ALL.into_iter().filter(|kind| self.contains(*kind)).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry").field("kinds", &self.kinds()).finish()
    }
}
