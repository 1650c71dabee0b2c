//! Performance events for allocation and migration.
//!
//! The coherence engine reports every backend allocation, release and
//! cross-space transfer through the helpers in this module so that log
//! consumers see one consistent event shape.
//!
//! ```rust
//! use coheron_tracing::performance::{record_allocation, record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("resolve", Some(100));
//! record_allocation(4096, "Device", 64, 12);
//! record_transfer(4096, "Host->Device", 40);
//! drop(span);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(true);

// u64::MAX encodes "no threshold".
static THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Toggle emission of performance events process-wide.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether performance events are currently emitted.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Default threshold applied by [`PerformanceSpan::with_default_threshold`].
pub fn set_threshold_us(threshold_us: Option<u64>) {
    THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

fn default_threshold_us() -> Option<u64> {
    match THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        value => Some(value),
    }
}

/// RAII guard that measures a span and logs its duration when dropped, if the
/// duration reaches the optional threshold.
pub struct PerformanceSpan {
    span_name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a span logged at debug level.
    pub fn new(span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    /// Create a span using the process-wide threshold set by the tracing config.
    pub fn with_default_threshold(span_name: impl Into<String>) -> Self {
        Self::new(span_name, default_threshold_us())
    }

    /// Create a span at the given tracing level.
    pub fn with_level(level: Level, span_name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let span_name = span_name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %span_name),
            Level::DEBUG => tracing::debug_span!("perf", name = %span_name),
            Level::INFO => tracing::info_span!("perf", name = %span_name),
            Level::WARN => tracing::warn_span!("perf", name = %span_name),
            Level::ERROR => tracing::error_span!("perf", name = %span_name),
        };

        Self {
            span_name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.span_name
    }

    /// Elapsed time since the span was created.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
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
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a backend allocation in one memory space.
pub fn record_allocation(size_bytes: usize, space: &str, alignment: usize, duration_us: u64) {
    if !is_enabled() {
        return;
    }
    tracing::debug!(
        event = "allocation",
        size_bytes = size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        space = space,
        alignment = alignment,
        duration_us = duration_us,
        "memory_allocation"
    );
}

/// Record a backend release in one memory space.
pub fn record_release(size_bytes: usize, space: &str) {
    if !is_enabled() {
        return;
    }
    tracing::debug!(event = "release", size_bytes = size_bytes, space = space, "memory_release");
}

/// Record a cross-space transfer with bandwidth derived from its duration.
///
/// `direction` names the spaces involved, e.g. `Host->Device`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    if !is_enabled() {
        return;
    }
    let bandwidth_mbps = bandwidth_mbps(bytes, duration_us);

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        kb = bytes as f64 / 1024.0,
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Megabytes per second for `bytes` moved in `duration_us` (0 when the
/// duration is too short to measure).
pub fn bandwidth_mbps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    }
}
