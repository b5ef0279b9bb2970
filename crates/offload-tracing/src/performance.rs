//! Timing spans and standard events for kernel launches and data movement.
//!
//! ```rust
//! use offload_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("axpy", Some(100));
//! // ... launch ...
//! drop(span); // logged only when it took at least 100us
//!
//! record_transfer(8 * 1024, "H2D", 12);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(true);
// u64::MAX means "no global threshold".
static GLOBAL_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Apply process-wide performance span settings.
///
/// Called by [`crate::init_global_tracing`]; spans created afterwards honour
/// the flag, and a span without its own threshold uses `threshold_us`.
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    GLOBAL_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently log on drop.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    match GLOBAL_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        value => Some(value),
    }
}

/// Guard that times a region and logs its duration when dropped.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Start a debug-level span. `threshold_us` suppresses short spans.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Start a span at an explicit level.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };

        Self::from_span(name, threshold_us, span)
    }

    /// Time a region under a caller-built span, so extra fields recorded on
    /// `span` appear on the completion event.
    pub fn from_span(name: impl Into<String>, threshold_us: Option<u64>, span: tracing::Span) -> Self {
        Self {
            name: name.into(),
            threshold_us: threshold_us.or_else(global_threshold),
            start: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.map_or(true, |threshold| elapsed_us >= threshold) {
            let _entered = self.span.enter();
            tracing::debug!(duration_us = elapsed_us, "performance_span_complete");
        }
    }
}

fn per_second(amount: f64, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    amount / duration_us as f64 * 1_000_000.0
}

/// Record a host/device copy. `direction` is `"H2D"` or `"D2H"`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_mbps = per_second(bytes as f64, duration_us) / (1024.0 * 1024.0);
    tracing::trace!(
        event = "transfer",
        bytes,
        direction,
        duration_us,
        bandwidth_mbps,
        "data_transfer"
    );
}

/// Record a device launch: grid size, lanes per block and wall time.
pub fn record_launch(kernel: &str, blocks: u64, lanes_per_block: u32, duration_us: u64) {
    tracing::debug!(
        event = "launch",
        kernel,
        blocks,
        lanes_per_block,
        duration_us,
        "device_launch"
    );
}

/// Record floating-point throughput for a completed kernel.
pub fn record_flops(kernel: &str, flops: usize, duration_us: u64) {
    let gflops = per_second(flops as f64, duration_us) / 1e9;
    tracing::debug!(event = "flops", kernel, flops, duration_us, gflops, "compute_performance");
}
