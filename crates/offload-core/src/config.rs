//! Run and dispatcher configuration
//!
//! [`RunConfig`] carries the per-call choices; [`DispatcherConfig`] holds
//! the defaults plus the resources the dispatcher builds at startup.
//! Both are plain serde types and can be loaded from JSON or from
//! `OFFLOAD_*` environment variables.

use crate::error::{Error, Result};
use offload_backends::backends::cpu::DEFAULT_CHUNK_SIZE;
use offload_backends::{BackendKind, DeviceConfig, ExecutionHints};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;

pub const ENV_BACKEND: &str = "OFFLOAD_BACKEND";
pub const ENV_ALLOW_FALLBACK: &str = "OFFLOAD_ALLOW_FALLBACK";
pub const ENV_PARALLEL_THRESHOLD: &str = "OFFLOAD_PARALLEL_THRESHOLD";
pub const ENV_ASYNC: &str = "OFFLOAD_ASYNC";
pub const ENV_WORKER_THREADS: &str = "OFFLOAD_WORKER_THREADS";
pub const ENV_DEVICE_BLOCK_SIZE: &str = "OFFLOAD_DEVICE_BLOCK_SIZE";
pub const ENV_DEVICE_MEMORY_BYTES: &str = "OFFLOAD_DEVICE_MEMORY_BYTES";

/// Default operand length at which auto-selection leaves the sequential backend.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 10_000;

/// Backend requested for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendChoice {
    /// Let the dispatcher pick from operand sizes and registered backends.
    #[default]
    Auto,
    HostSequential,
    HostParallel,
    DeviceOffload,
}

impl BackendChoice {
    /// The explicit backend, or `None` for `Auto`.
    pub fn explicit(self) -> Option<BackendKind> {
        match self {
            Self::Auto => None,
            Self::HostSequential => Some(BackendKind::HostSequential),
            Self::HostParallel => Some(BackendKind::HostParallel),
            Self::DeviceOffload => Some(BackendKind::DeviceOffload),
        }
    }
}

impl From<BackendKind> for BackendChoice {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::HostSequential => Self::HostSequential,
            BackendKind::HostParallel => Self::HostParallel,
            BackendKind::DeviceOffload => Self::DeviceOffload,
        }
    }
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.explicit() {
            Some(kind) => kind.fmt(f),
            None => f.write_str("auto"),
        }
    }
}

impl FromStr for BackendChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse::<BackendKind>().map(Self::from).map_err(Error::InvalidConfig)
    }
}

/// Options for one dispatcher call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub backend: BackendChoice,
    /// Use host-sequential when the requested backend is not registered.
    pub allow_fallback: bool,
    /// Operand length from which `Auto` prefers parallel or device backends.
    pub parallel_threshold: usize,
    /// Return a pending run instead of waiting (see `Dispatcher::dispatch`).
    pub async_mode: bool,
    /// Lanes per block for device launches; `None` uses the backend default.
    pub device_block_size: Option<u32>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            allow_fallback: false,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            async_mode: false,
            device_block_size: None,
        }
    }
}

impl RunConfig {
    pub fn with_backend(backend: impl Into<BackendChoice>) -> Self {
        Self {
            backend: backend.into(),
            ..Self::default()
        }
    }

    pub fn allow_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = allow;
        self
    }

    pub fn parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn async_mode(mut self, enabled: bool) -> Self {
        self.async_mode = enabled;
        self
    }

    pub fn device_block_size(mut self, block_size: u32) -> Self {
        self.device_block_size = Some(block_size);
        self
    }

    pub fn hints(&self) -> ExecutionHints {
        ExecutionHints {
            block_size: self.device_block_size,
        }
    }
}

/// Dispatcher-wide settings: run defaults and backend resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Used by calls that do not pass their own [`RunConfig`].
    pub defaults: RunConfig,
    /// Host-parallel pool size; `0` uses the available parallelism.
    pub worker_threads: usize,
    /// Elements per host-parallel chunk.
    pub chunk_size: usize,
    /// Simulated device to register; `None` registers host backends only.
    pub device: Option<DeviceConfig>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            defaults: RunConfig::default(),
            worker_threads: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            device: None,
        }
    }
}

impl DispatcherConfig {
    /// Host backends only.
    pub fn host_only() -> Self {
        Self::default()
    }

    /// Host backends plus a simulated device.
    pub fn with_device(device: DeviceConfig) -> Self {
        Self {
            device: Some(device),
            ..Self::default()
        }
    }

    /// Apply `OFFLOAD_*` environment overrides to the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_BACKEND) {
            config.defaults.backend = value.parse()?;
        }
        if let Some(value) = lookup(ENV_ALLOW_FALLBACK) {
            config.defaults.allow_fallback = parse_flag(ENV_ALLOW_FALLBACK, &value)?;
        }
        if let Some(value) = lookup(ENV_PARALLEL_THRESHOLD) {
            config.defaults.parallel_threshold = parse_number(ENV_PARALLEL_THRESHOLD, &value)?;
        }
        if let Some(value) = lookup(ENV_ASYNC) {
            config.defaults.async_mode = parse_flag(ENV_ASYNC, &value)?;
        }
        if let Some(value) = lookup(ENV_WORKER_THREADS) {
            config.worker_threads = parse_number(ENV_WORKER_THREADS, &value)?;
        }
        if let Some(value) = lookup(ENV_DEVICE_BLOCK_SIZE) {
            config.defaults.device_block_size = Some(parse_number(ENV_DEVICE_BLOCK_SIZE, &value)?);
        }
        if let Some(value) = lookup(ENV_DEVICE_MEMORY_BYTES) {
            let memory_bytes = parse_number(ENV_DEVICE_MEMORY_BYTES, &value)?;
            config.device = Some(DeviceConfig {
                memory_bytes,
                ..DeviceConfig::default()
            });
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| Error::InvalidConfig(format!("malformed JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| Error::InvalidConfig(err.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be at least 1".to_string()));
        }
        if let Some(device) = &self.device {
            if device.compute_units == 0 {
                return Err(Error::InvalidConfig("device compute_units must be at least 1".to_string()));
            }
            if device.max_lanes_per_block == 0 {
                return Err(Error::InvalidConfig(
                    "device max_lanes_per_block must be at least 1".to_string(),
                ));
            }
            if let Some(block_size) = self.defaults.device_block_size {
                if block_size == 0 || block_size > device.max_lanes_per_block {
                    return Err(Error::InvalidConfig(format!(
                        "device_block_size {block_size} outside 1..={}",
                        device.max_lanes_per_block
                    )));
                }
            }
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::InvalidConfig(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{key}: expected a non-negative integer, got {value:?}")))
}
