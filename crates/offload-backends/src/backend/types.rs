//! Types for backend selection, residency and device launches

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Execution strategy implemented by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Single thread, ascending index order. The correctness reference.
    HostSequential,
    /// Fixed worker pool over contiguous chunks.
    HostParallel,
    /// Separate execution context with its own memory.
    DeviceOffload,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::HostSequential, Self::HostParallel, Self::DeviceOffload];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HostSequential => "host-sequential",
            Self::HostParallel => "host-parallel",
            Self::DeviceOffload => "device-offload",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host-sequential" | "sequential" | "seq" => Ok(Self::HostSequential),
            "host-parallel" | "parallel" | "par" => Ok(Self::HostParallel),
            "device-offload" | "device" | "offload" => Ok(Self::DeviceOffload),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// Which memory domain currently holds a handle's valid data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Residency {
    /// Valid on the host only.
    Host,
    /// Valid on the device only.
    Device,
    /// Valid and identical on both.
    Mirrored,
    /// Unknown after an abandoned launch; must be revalidated.
    Indeterminate,
}

impl Residency {
    pub const fn is_host_valid(self) -> bool {
        matches!(self, Self::Host | Self::Mirrored)
    }

    pub const fn is_device_valid(self) -> bool {
        matches!(self, Self::Device | Self::Mirrored)
    }
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host => "host",
            Self::Device => "device",
            Self::Mirrored => "mirrored",
            Self::Indeterminate => "indeterminate",
        })
    }
}

/// Where a backend needs its operands before `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResidencyRequirement {
    Host,
    Device,
}

impl ResidencyRequirement {
    /// Residency that satisfies this requirement for a given operand.
    ///
    /// Device inputs are mirrored so the host copy stays readable; device
    /// outputs drop the host copy because the launch will make it stale.
    pub const fn target(self, is_output: bool) -> Residency {
        match (self, is_output) {
            (Self::Host, _) => Residency::Host,
            (Self::Device, false) => Residency::Mirrored,
            (Self::Device, true) => Residency::Device,
        }
    }

    pub const fn is_satisfied_by(self, residency: Residency) -> bool {
        match self {
            Self::Host => residency.is_host_valid(),
            Self::Device => residency.is_device_valid(),
        }
    }
}

/// Capability descriptor published by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub kind: BackendKind,
    pub required_residency: ResidencyRequirement,
    /// `launch` returns before the work completes.
    pub supports_async: bool,
    /// Repeated reductions return identical bits.
    pub deterministic_reduction: bool,
    /// Threads or execution units available to one launch.
    pub worker_count: usize,
}

/// Per-call tuning passed from the dispatcher to a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHints {
    /// Lanes per block for device launches. `None` uses the backend default.
    pub block_size: Option<u32>,
}

/// Grid dimensions of a device launch (blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GridDim {
    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_blocks(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for GridDim {
    fn default() -> Self {
        Self::linear(1)
    }
}

impl fmt::Display for GridDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Block dimensions of a device launch (lanes per block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockDim {
    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_lanes(&self) -> u32 {
        self.x * self.y * self.z
    }
}

impl Default for BlockDim {
    fn default() -> Self {
        Self::linear(1)
    }
}

impl fmt::Display for BlockDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Iteration space of a device launch: `grid × block` lanes, one per
/// work item, the last block possibly partial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: GridDim,
    pub block: BlockDim,
}

impl LaunchConfig {
    /// 1D launch covering `work_items` with `block_size` lanes per block.
    pub fn linear(work_items: usize, block_size: u32) -> Self {
        let block_size = block_size.max(1);
        let blocks = work_items.div_ceil(block_size as usize).max(1);
        Self {
            grid: GridDim::linear(u32::try_from(blocks).unwrap_or(u32::MAX)),
            block: BlockDim::linear(block_size),
        }
    }

    pub fn lanes_per_block(&self) -> usize {
        self.block.total_lanes() as usize
    }

    pub fn total_lanes(&self) -> u64 {
        self.grid.total_blocks() * self.block.total_lanes() as u64
    }
}
