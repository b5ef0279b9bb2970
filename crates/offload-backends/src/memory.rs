//! Memory handles with explicit host/device residency
//!
//! A [`MemoryHandle`] owns a fixed-length buffer of `f64`. Its valid data
//! lives on the host, on a device, or on both ([`Residency::Mirrored`]).
//! Residency only changes through [`MemoryHandle::migrate`]; host accessors
//! never move data implicitly and fail on device-only handles instead.
//!
//! ```rust
//! use offload_backends::{DeviceConfig, DeviceContext, MemoryHandle, Residency};
//!
//! # fn main() -> offload_backends::Result<()> {
//! let device = DeviceContext::new(DeviceConfig::default())?;
//! let mut x = MemoryHandle::create(4)?;
//! x.set(2, 1.5)?;
//!
//! x.migrate(Residency::Device, Some(&device))?;
//! assert!(x.get(2).is_err()); // device-only data is not host-readable
//!
//! x.migrate(Residency::Host, None)?;
//! assert_eq!(x.get(2)?, 1.5);
//! # Ok(())
//! # }
//! ```

use crate::backend::Residency;
use crate::backends::device::memory::require_device;
use crate::backends::device::{DeviceBuffer, DeviceContext};
use crate::error::{BackendError, Result};
use offload_tracing::performance::record_transfer;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a handle, used in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Owned numeric buffer with tracked residency.
///
/// Dropping the handle frees its host storage and returns its device
/// allocation (if any) to the device arena.
pub struct MemoryHandle {
    id: HandleId,
    len: usize,
    residency: Residency,
    /// Valid while `residency.is_host_valid()`; released otherwise.
    host: Vec<f64>,
    /// Valid while `residency.is_device_valid()`, or fenced while indeterminate.
    device: Option<DeviceBuffer>,
    /// Device epoch at the last host/device synchronisation.
    synced_epoch: u64,
    generation: u64,
}

fn allocate_host(len: usize) -> Result<Vec<f64>> {
    let mut values = Vec::new();
    values.try_reserve_exact(len).map_err(|err| BackendError::Allocation {
        requested: len,
        reason: err.to_string(),
    })?;
    values.resize(len, 0.0);
    Ok(values)
}

impl MemoryHandle {
    /// Allocate a zero-initialised host buffer of `size` elements.
    pub fn create(size: usize) -> Result<Self> {
        let host = allocate_host(size)?;
        let handle = Self::from_host(host);
        tracing::trace!(handle = %handle.id, len = size, "handle_created");
        Ok(handle)
    }

    /// Take ownership of existing values.
    pub fn from_vec(values: Vec<f64>) -> Self {
        Self::from_host(values)
    }

    fn from_host(host: Vec<f64>) -> Self {
        Self {
            id: HandleId::next(),
            len: host.len(),
            residency: Residency::Host,
            host,
            device: None,
            synced_epoch: 0,
            generation: 0,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Counter advanced by every change to the handle's values.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Device holding this handle's device copy, if any.
    pub fn device_context(&self) -> Option<&Arc<DeviceContext>> {
        self.device.as_ref().map(DeviceBuffer::context)
    }

    /// Bytes this handle would occupy on a device.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<f64>()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.len {
            return Err(BackendError::OutOfRange { index, len: self.len });
        }
        Ok(())
    }

    fn ensure_host_readable(&self) -> Result<()> {
        match self.residency {
            Residency::Host | Residency::Mirrored => Ok(()),
            Residency::Device => Err(BackendError::unsupported_residency(
                Residency::Device,
                format!("handle {} is device-resident; migrate it to the host first", self.id),
            )),
            Residency::Indeterminate => Err(BackendError::Indeterminate { handle: self.id }),
        }
    }

    pub fn get(&self, index: usize) -> Result<f64> {
        self.check_index(index)?;
        self.ensure_host_readable()?;
        Ok(self.host[index])
    }

    /// Write one element. A mirrored handle loses its device copy.
    pub fn set(&mut self, index: usize, value: f64) -> Result<()> {
        self.check_index(index)?;
        self.host_view_mut()?[index] = value;
        Ok(())
    }

    /// Host view of the values.
    pub fn as_slice(&self) -> Result<&[f64]> {
        self.ensure_host_readable()?;
        Ok(&self.host)
    }

    pub fn to_vec(&self) -> Result<Vec<f64>> {
        self.as_slice().map(<[f64]>::to_vec)
    }

    /// Mutable host view for in-place kernels.
    ///
    /// Requires host-valid data; the device copy of a mirrored handle is
    /// dropped because it is about to go stale.
    pub fn host_view_mut(&mut self) -> Result<&mut [f64]> {
        self.ensure_host_readable()?;
        if self.residency == Residency::Mirrored {
            self.device = None;
            self.residency = Residency::Host;
        }
        self.generation += 1;
        Ok(&mut self.host)
    }

    /// Overwrite every element from `values`, which must yield exactly
    /// `len()` items. Works from any residency; the result is host-resident.
    pub fn load_from<I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut staged = Vec::new();
        staged.try_reserve_exact(self.len).map_err(|err| BackendError::Allocation {
            requested: self.len,
            reason: err.to_string(),
        })?;
        for value in values {
            if staged.len() == self.len {
                return Err(BackendError::shape_mismatch(
                    "load_from",
                    format!("more than {} values supplied", self.len),
                ));
            }
            staged.push(value);
        }
        if staged.len() != self.len {
            return Err(BackendError::shape_mismatch(
                "load_from",
                format!("{} values supplied for a handle of length {}", staged.len(), self.len),
            ));
        }
        self.replace_host(staged);
        Ok(())
    }

    pub fn copy_from_slice(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.len {
            return Err(BackendError::shape_mismatch(
                "copy_from_slice",
                format!("{} values supplied for a handle of length {}", values.len(), self.len),
            ));
        }
        self.load_from(values.iter().copied())
    }

    /// Load native-endian packed `f64` values.
    pub fn load_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.size_bytes() {
            return Err(BackendError::shape_mismatch(
                "load_from_bytes",
                format!("{} bytes supplied, {} expected", bytes.len(), self.size_bytes()),
            ));
        }
        let values: Vec<f64> = bytemuck::pod_collect_to_vec(bytes);
        self.replace_host(values);
        Ok(())
    }

    /// Host values as native-endian bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bytemuck::cast_slice::<f64, u8>(self.as_slice()?).to_vec())
    }

    pub fn fill(&mut self, value: f64) -> Result<()> {
        self.load_from(std::iter::repeat(value).take(self.len))
    }

    /// Deep copy into a new host-resident handle.
    pub fn try_clone(&self) -> Result<Self> {
        let source = self.as_slice()?;
        let mut host = allocate_host(self.len)?;
        host.copy_from_slice(source);
        Ok(Self::from_host(host))
    }

    fn replace_host(&mut self, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.len);
        self.host = values;
        self.device = None;
        self.residency = Residency::Host;
        self.generation += 1;
    }

    /// Make the data valid at `target`.
    ///
    /// A no-op when already there. Moving to or staying on a device needs
    /// `device`; moving to the host ignores it. A device copy on a different
    /// context than `device` is re-uploaded through the host.
    pub fn migrate(&mut self, target: Residency, device: Option<&Arc<DeviceContext>>) -> Result<()> {
        if target == Residency::Indeterminate {
            return Err(BackendError::unsupported_residency(
                target,
                "indeterminate is not a migration target",
            ));
        }
        if self.residency == Residency::Indeterminate {
            return Err(BackendError::Indeterminate { handle: self.id });
        }

        if target.is_device_valid() && self.residency.is_device_valid() {
            if let (Some(context), Some(buffer)) = (device, self.device.as_ref()) {
                if !buffer.is_on(context) {
                    self.migrate(Residency::Host, None)?;
                }
            }
        }

        if self.residency == target {
            tracing::trace!(handle = %self.id, residency = %target, "migrate_noop");
            return Ok(());
        }

        let from = self.residency;
        match (from, target) {
            (Residency::Host, Residency::Device | Residency::Mirrored) => {
                let context = require_device(device, target)?;
                self.upload(context)?;
                if target == Residency::Device {
                    self.release_host();
                }
            }
            (Residency::Mirrored, Residency::Device) => self.release_host(),
            (Residency::Mirrored, Residency::Host) => self.device = None,
            (Residency::Device, Residency::Host | Residency::Mirrored) => {
                self.download()?;
                if target == Residency::Host {
                    self.device = None;
                }
            }
            _ => {
                return Err(BackendError::unsupported_residency(
                    target,
                    format!("cannot migrate handle {} from {from}", self.id),
                ))
            }
        }

        self.residency = target;
        tracing::trace!(handle = %self.id, %from, to = %target, "migrated");
        Ok(())
    }

    /// Clear an indeterminate state by adopting the fenced device contents.
    ///
    /// The device copy may hold either the pre-launch values or the
    /// abandoned launch's result; callers that care must check the data.
    pub fn revalidate(&mut self) -> Result<Residency> {
        if self.residency != Residency::Indeterminate {
            return Ok(self.residency);
        }
        if self.device.is_none() {
            return Err(BackendError::Indeterminate { handle: self.id });
        }
        self.download()?;
        self.device = None;
        self.residency = Residency::Host;
        self.generation += 1;
        tracing::debug!(handle = %self.id, "handle_revalidated");
        Ok(self.residency)
    }

    fn upload(&mut self, context: &Arc<DeviceContext>) -> Result<()> {
        let start = Instant::now();
        let buffer = context.upload(&self.host)?;
        self.synced_epoch = buffer.epoch();
        self.device = Some(buffer);
        record_transfer(self.size_bytes(), "H2D", start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn download(&mut self) -> Result<()> {
        let start = Instant::now();
        let Some(buffer) = self.device.as_ref() else {
            return Err(BackendError::unsupported_residency(
                Residency::Host,
                format!("handle {} has no device copy to download", self.id),
            ));
        };
        if self.host.len() != self.len {
            self.host = allocate_host(self.len)?;
        }
        buffer.download(&mut self.host);
        let epoch = buffer.epoch();
        if epoch != self.synced_epoch {
            self.generation += 1;
            self.synced_epoch = epoch;
        }
        record_transfer(self.size_bytes(), "D2H", start.elapsed().as_micros() as u64);
        Ok(())
    }

    fn release_host(&mut self) {
        self.host = Vec::new();
    }

    /// Device copy for a launch; requires device-valid data.
    pub fn device_buffer(&self) -> Result<&DeviceBuffer> {
        match (&self.device, self.residency) {
            (Some(buffer), residency) if residency.is_device_valid() => Ok(buffer),
            (_, Residency::Indeterminate) => Err(BackendError::Indeterminate { handle: self.id }),
            (_, residency) => Err(BackendError::unsupported_residency(
                residency,
                format!("handle {} is not device-resident", self.id),
            )),
        }
    }

    /// Flag the handle after a launch was abandoned mid-flight.
    ///
    /// The device copy is fenced so the launch can no longer commit into it.
    pub fn abandon_pending_write(&mut self) {
        if let Some(buffer) = &self.device {
            buffer.fence();
        }
        self.host = Vec::new();
        self.residency = Residency::Indeterminate;
        tracing::warn!(handle = %self.id, "handle_indeterminate");
    }
}

impl fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("residency", &self.residency)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        tracing::trace!(handle = %self.id, residency = %self.residency, "handle_released");
    }
}
