//! Backend implementations for different execution targets
//!
//! - `cpu` - host backends (sequential reference, rayon-parallel)
//! - `device` - device context, device buffers and the offload backend

pub mod cpu;
pub mod device;

pub use cpu::{HostParallelBackend, HostSequentialBackend};
pub use device::{DeviceBuffer, DeviceConfig, DeviceContext, DeviceOffloadBackend};
