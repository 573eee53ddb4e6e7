//! Optional metrics instrumentation.
//!
//! With the `observe` feature enabled, key operations emit counters and
//! histograms via the [`metrics`] crate; a downstream application installs a
//! recorder to collect them. Without the feature every function here is a
//! zero-cost no-op.

/// Record a batch of ingested events.
///
/// - `ethogram.ingest.events_total` – counter
/// - `ethogram.ingest.duration_seconds` – histogram
#[inline]
pub fn record_ingest(events: usize, duration: std::time::Duration) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("ethogram.ingest.events_total").increment(events as u64);
        metrics::histogram!("ethogram.ingest.duration_seconds").record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (events, duration);
    }
}

/// Record a completed (or failed) query.
///
/// - `ethogram.query.total` – counter with `outcome` label
/// - `ethogram.query.duration_seconds` – histogram
#[inline]
pub fn record_query(duration: std::time::Duration, success: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if success { "ok" } else { "fail" };
        metrics::counter!("ethogram.query.total", "outcome" => outcome).increment(1);
        metrics::histogram!("ethogram.query.duration_seconds").record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, success);
    }
}

/// Record a factor cache hit or miss.
///
/// - `ethogram.factor_cache.lookups_total` – counter with `result` label
#[inline]
pub fn record_factor_cache(hit: bool) {
    #[cfg(feature = "observe")]
    {
        let result = if hit { "hit" } else { "miss" };
        metrics::counter!("ethogram.factor_cache.lookups_total", "result" => result).increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = hit;
    }
}
