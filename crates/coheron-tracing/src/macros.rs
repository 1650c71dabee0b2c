//! Convenience macros for performance tracing.

/// Create a [`crate::performance::PerformanceSpan`] with optional fields,
/// logged when the returned guard is dropped.
///
/// ```rust
/// use coheron_tracing::perf_span;
///
/// {
///     let _span = perf_span!("reallocate", record = 7u64, bytes = 4096);
///     // ... operation code ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::with_default_threshold($name)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::with_default_threshold($name)
    }};
}

/// Emit a debug-level performance event with the given metrics.
///
/// ```rust
/// use coheron_tracing::perf_event;
///
/// perf_event!("slot_invalidated", record = 3u64, space = "Host");
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        if $crate::performance::is_enabled() {
            tracing::debug!(
                event = $name,
                $($field = $value),+
            );
        }
    };
}
