//! Per-run metrics and per-kernel timing aggregation
//!
//! Every dispatcher run produces an [`ExecutionMetrics`] record that is
//! logged via `tracing`. A [`KernelProfiler`] attached to the dispatcher
//! aggregates those records per kernel and backend:
//!
//! ```text
//! kernel   backend          count   total(us)   avg(us)   min(us)   max(us)   %time
//! matvec   host-parallel       10     1520.00    152.00    140.10    170.33    81.2
//! axpy     device-offload      40      352.00      8.80      6.90     14.02    18.8
//! ```

use offload_backends::BackendKind;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

// ============================================================================
// Execution-Level Metrics
// ============================================================================

/// Metrics for one dispatched kernel (migration + execution).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    /// Kernel name (`axpy`, `dot`, `matvec`, `scal`)
    pub kernel: &'static str,
    /// Backend that ran the kernel
    pub backend: BackendKind,
    /// Largest operand length
    pub elements: usize,
    /// Floating-point operations
    pub logical_ops: usize,
    /// Wall time from dispatch to outputs back on the host (microseconds)
    pub total_duration_us: u64,
    /// Part of the total spent in the backend (microseconds)
    pub execution_time_us: u64,
    /// Ran on host-sequential because the requested backend was missing
    pub fell_back: bool,
}

impl ExecutionMetrics {
    /// Metrics for a run that started at `start` and spent `execution` in the backend.
    pub fn new(
        kernel: &'static str,
        backend: BackendKind,
        elements: usize,
        logical_ops: usize,
        start: Instant,
        execution: Duration,
    ) -> Self {
        Self {
            kernel,
            backend,
            elements,
            logical_ops,
            total_duration_us: start.elapsed().as_micros() as u64,
            execution_time_us: execution.as_micros() as u64,
            fell_back: false,
        }
    }

    pub fn with_fallback(mut self, fell_back: bool) -> Self {
        self.fell_back = fell_back;
        self
    }

    /// Calculate operations per second
    pub fn ops_per_second(&self) -> f64 {
        if self.total_duration_us == 0 {
            return 0.0;
        }
        (self.logical_ops as f64 / self.total_duration_us as f64) * 1_000_000.0
    }

    /// Time outside the backend (migrations, validation), in percent.
    pub fn movement_overhead_percent(&self) -> f64 {
        if self.total_duration_us == 0 {
            return 0.0;
        }
        let overhead = self.total_duration_us.saturating_sub(self.execution_time_us);
        (overhead as f64 / self.total_duration_us as f64) * 100.0
    }

    /// Log metrics via tracing
    pub fn log(&self) {
        tracing::debug!(
            kernel = self.kernel,
            backend = %self.backend,
            elements = self.elements,
            logical_ops = self.logical_ops,
            total_duration_us = self.total_duration_us,
            execution_time_us = self.execution_time_us,
            ops_per_second = self.ops_per_second(),
            movement_overhead_percent = self.movement_overhead_percent(),
            fell_back = self.fell_back,
            "kernel_dispatched"
        );
    }
}

// ============================================================================
// Kernel Profiler
// ============================================================================

/// Aggregated timings for one kernel on one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelStats {
    pub kernel: &'static str,
    pub backend: BackendKind,
    pub count: usize,
    pub total_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    /// Median of the most recent [`MEDIAN_WINDOW`] runs.
    pub median_us: u64,
    /// Share of the profiler's total time, in percent.
    pub share_percent: f64,
}

impl KernelStats {
    pub fn avg_us(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_us as f64 / self.count as f64
    }
}

/// Number of recent durations kept per kernel/backend pair for the median.
pub const MEDIAN_WINDOW: usize = 1024;

/// Running totals for one kernel/backend pair. Memory stays bounded by
/// [`MEDIAN_WINDOW`] no matter how many runs are recorded.
#[derive(Debug, Default)]
struct Accumulator {
    count: usize,
    total_us: u64,
    min_us: u64,
    max_us: u64,
    recent: VecDeque<u64>,
}

impl Accumulator {
    fn push(&mut self, duration_us: u64) {
        if self.count == 0 {
            self.min_us = duration_us;
            self.max_us = duration_us;
        } else {
            self.min_us = self.min_us.min(duration_us);
            self.max_us = self.max_us.max(duration_us);
        }
        self.count += 1;
        self.total_us = self.total_us.saturating_add(duration_us);

        if self.recent.len() == MEDIAN_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(duration_us);
    }

    fn median_us(&self) -> u64 {
        let mut sorted: Vec<u64> = self.recent.iter().copied().collect();
        sorted.sort_unstable();
        sorted.get(sorted.len() / 2).copied().unwrap_or(0)
    }
}

/// Thread-safe collector of [`ExecutionMetrics`].
#[derive(Debug, Default)]
pub struct KernelProfiler {
    samples: Mutex<HashMap<(&'static str, BackendKind), Accumulator>>,
}

impl KernelProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metrics: &ExecutionMetrics) {
        self.samples
            .lock()
            .entry((metrics.kernel, metrics.backend))
            .or_default()
            .push(metrics.total_duration_us);
    }

    /// Total dispatches recorded.
    pub fn dispatch_count(&self) -> usize {
        self.samples.lock().values().map(|acc| acc.count).sum()
    }

    pub fn total_us(&self) -> u64 {
        self.samples.lock().values().map(|acc| acc.total_us).sum()
    }

    /// Per-kernel statistics, largest total time first.
    pub fn summary(&self) -> Vec<KernelStats> {
        let samples = self.samples.lock();
        let grand_total: u64 = samples.values().map(|acc| acc.total_us).sum();

        let mut stats: Vec<KernelStats> = samples
            .iter()
            .filter(|(_, acc)| acc.count > 0)
            .map(|(&(kernel, backend), acc)| KernelStats {
                kernel,
                backend,
                count: acc.count,
                total_us: acc.total_us,
                min_us: acc.min_us,
                max_us: acc.max_us,
                median_us: acc.median_us(),
                share_percent: if grand_total == 0 {
                    0.0
                } else {
                    acc.total_us as f64 / grand_total as f64 * 100.0
                },
            })
            .collect();

        stats.sort_by(|a, b| {
            b.total_us
                .cmp(&a.total_us)
                .then_with(|| a.kernel.cmp(b.kernel))
                .then_with(|| a.backend.as_str().cmp(b.backend.as_str()))
        });
        stats
    }

    pub fn reset(&self) {
        self.samples.lock().clear();
    }

    /// Log the summary, one `info!` per kernel/backend pair.
    pub fn log_summary(&self) {
        let summary = self.summary();
        tracing::info!(
            dispatches = summary.iter().map(|s| s.count).sum::<usize>(),
            kernel_types = summary.len(),
            total_us = summary.iter().map(|s| s.total_us).sum::<u64>(),
            "kernel_profile"
        );
        for stats in &summary {
            tracing::info!(
                kernel = stats.kernel,
                backend = %stats.backend,
                count = stats.count,
                total_us = stats.total_us,
                avg_us = stats.avg_us(),
                min_us = stats.min_us,
                max_us = stats.max_us,
                median_us = stats.median_us,
                share_percent = stats.share_percent,
                "kernel_profile_entry"
            );
        }
    }
}
