//! Device context and device-resident buffers
//!
//! The device is a separate execution context: a bounded memory arena plus a
//! dedicated pool of execution units. Host code never reads device memory
//! directly; data moves only through [`MemoryHandle::migrate`](crate::MemoryHandle::migrate).

use crate::backend::{BackendKind, Residency};
use crate::error::{BackendError, Result};
use offload_tracing::perf_event;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const BYTES_PER_ELEMENT: usize = std::mem::size_of::<f64>();

/// Static description of a device context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    /// Arena size; allocations beyond it fail with `Allocation`.
    pub memory_bytes: usize,
    /// Execution units (worker threads) backing launches.
    pub compute_units: usize,
    /// Largest block a launch may request.
    pub max_lanes_per_block: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "sim0".to_string(),
            memory_bytes: 256 * 1024 * 1024,
            compute_units: std::thread::available_parallelism().map_or(4, |n| n.get()),
            max_lanes_per_block: 1024,
        }
    }
}

/// A device: memory arena accounting plus its own execution units.
pub struct DeviceContext {
    config: DeviceConfig,
    allocated_bytes: AtomicUsize,
    lost: AtomicBool,
    units: rayon::ThreadPool,
}

impl DeviceContext {
    pub fn new(config: DeviceConfig) -> Result<Arc<Self>> {
        let name = config.name.clone();
        let units = rayon::ThreadPoolBuilder::new()
            .num_threads(config.compute_units.max(1))
            .thread_name(move |index| format!("{name}-unit-{index}"))
            .build()
            .map_err(|err| BackendError::execution_error(BackendKind::DeviceOffload, err))?;

        tracing::debug!(
            device = %config.name,
            memory_bytes = config.memory_bytes,
            compute_units = config.compute_units,
            "device_context_created"
        );

        Ok(Arc::new(Self {
            config,
            allocated_bytes: AtomicUsize::new(0),
            lost: AtomicBool::new(false),
            units,
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn capacity_bytes(&self) -> usize {
        self.config.memory_bytes
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    pub fn free_bytes(&self) -> usize {
        self.capacity_bytes().saturating_sub(self.allocated_bytes())
    }

    pub fn compute_units(&self) -> usize {
        self.units.current_num_threads()
    }

    pub fn max_lanes_per_block(&self) -> u32 {
        self.config.max_lanes_per_block
    }

    /// Mark the device as failed; every later launch reports an execution error.
    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
        tracing::warn!(device = %self.config.name, "device_marked_lost");
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn units(&self) -> &rayon::ThreadPool {
        &self.units
    }

    /// Copy `values` into a fresh device allocation.
    pub(crate) fn upload(self: &Arc<Self>, values: &[f64]) -> Result<DeviceBuffer> {
        let bytes = values.len() * BYTES_PER_ELEMENT;
        self.reserve(values.len(), bytes)?;

        let mut data = Vec::new();
        if let Err(err) = data.try_reserve_exact(values.len()) {
            self.release(bytes);
            return Err(BackendError::Allocation {
                requested: values.len(),
                reason: err.to_string(),
            });
        }
        data.extend_from_slice(values);

        perf_event!("device_alloc", device = self.name(), bytes = bytes);
        Ok(DeviceBuffer {
            storage: Arc::new(DeviceStorage {
                context: Arc::clone(self),
                bytes,
                data: RwLock::new(DeviceData { values: data, epoch: 0 }),
            }),
        })
    }

    fn reserve(&self, elements: usize, bytes: usize) -> Result<()> {
        let capacity = self.capacity_bytes();
        self.allocated_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= capacity)
            })
            .map(|_| ())
            .map_err(|used| BackendError::Allocation {
                requested: elements,
                reason: format!(
                    "device {} has {} of {} bytes free, {} needed",
                    self.name(),
                    capacity.saturating_sub(used),
                    capacity,
                    bytes
                ),
            })
    }

    fn release(&self, bytes: usize) {
        self.allocated_bytes.fetch_sub(bytes, Ordering::AcqRel);
        perf_event!("device_free", device = self.name(), bytes = bytes);
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("name", &self.config.name)
            .field("allocated_bytes", &self.allocated_bytes())
            .field("capacity_bytes", &self.capacity_bytes())
            .field("compute_units", &self.compute_units())
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// Contents of a device allocation.
///
/// `epoch` advances on every write. Launches record it at submission and
/// commit only if it is unchanged, which rejects late writes from cancelled
/// or abandoned launches.
pub(crate) struct DeviceData {
    pub(crate) values: Vec<f64>,
    pub(crate) epoch: u64,
}

struct DeviceStorage {
    context: Arc<DeviceContext>,
    bytes: usize,
    data: RwLock<DeviceData>,
}

impl Drop for DeviceStorage {
    fn drop(&mut self) {
        self.context.release(self.bytes);
    }
}

/// Device allocation shared between a handle and in-flight launches.
///
/// The arena bytes are returned when the last reference drops, so a
/// launch still running against a released handle keeps its memory alive
/// until it finishes.
#[derive(Clone)]
pub struct DeviceBuffer {
    storage: Arc<DeviceStorage>,
}

impl DeviceBuffer {
    pub fn len(&self) -> usize {
        self.storage.data.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.storage.context
    }

    pub fn epoch(&self) -> u64 {
        self.storage.data.read().epoch
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, DeviceData> {
        self.storage.data.read()
    }

    pub(crate) fn download(&self, host: &mut [f64]) {
        host.copy_from_slice(&self.storage.data.read().values);
    }

    /// Replace the contents if nobody wrote since `expected_epoch`.
    pub(crate) fn commit(&self, expected_epoch: u64, values: Vec<f64>) -> std::result::Result<u64, u64> {
        let mut data = self.storage.data.write();
        if data.epoch != expected_epoch {
            return Err(data.epoch);
        }
        data.values = values;
        data.epoch += 1;
        Ok(data.epoch)
    }

    /// Advance the epoch so any pending commit is rejected.
    pub(crate) fn fence(&self) -> u64 {
        let mut data = self.storage.data.write();
        data.epoch += 1;
        data.epoch
    }

    pub(crate) fn is_on(&self, context: &Arc<DeviceContext>) -> bool {
        Arc::ptr_eq(&self.storage.context, context)
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.storage.context.name())
            .field("bytes", &self.storage.bytes)
            .finish()
    }
}

pub(crate) fn require_device(device: Option<&Arc<DeviceContext>>, target: Residency) -> Result<&Arc<DeviceContext>> {
    device.ok_or_else(|| BackendError::unsupported_residency(target, "no device context available"))
}
