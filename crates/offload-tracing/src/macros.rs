//! Shorthand macros over [`crate::performance`].

/// Start a [`crate::performance::PerformanceSpan`]. Extra fields are recorded
/// on its span and reported with the completion event when it drops.
///
/// ```rust
/// use offload_tracing::perf_span;
///
/// let _span = perf_span!("migrate", bytes = 8192);
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::performance::PerformanceSpan::from_span(
            $name,
            None,
            tracing::debug_span!("perf", name = $name, $($field = $value),+),
        )
    }};
}

/// Emit a debug event tagged with `event = $name`.
///
/// ```rust
/// use offload_tracing::perf_event;
///
/// perf_event!("device_alloc", bytes = 4096, device = "sim0");
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(event = $name, $($field = $value),+);
    };
}

/// Run a block and return `(value, elapsed_us)`.
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let value = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::trace!(operation = $name, duration_us, "timed_block_complete");
        (value, duration_us)
    }};
}
