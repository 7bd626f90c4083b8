//! Prometheus metrics collection for viewsyncd.
//!
//! Provides observability via Prometheus metrics exposed on an HTTP
//! endpoint. Tracks CVR loads, flush throughput and arbitration failures,
//! and purger activity.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

use crate::cvr::records::CvrFlushStats;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters (monotonic increasing)
// ========================================================================

/// Total CVR snapshot loads.
pub static CVR_LOADS: OnceLock<IntCounter> = OnceLock::new();

/// Total successful CVR flushes.
pub static CVR_FLUSHES: OnceLock<IntCounter> = OnceLock::new();

/// Total row records written by flushes.
pub static CVR_ROWS_FLUSHED: OnceLock<IntCounter> = OnceLock::new();

/// Flush failures by error code (concurrent modification, ownership loss).
pub static CVR_FLUSH_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Client groups deleted by the purger.
pub static CVR_GROUPS_PURGED: OnceLock<IntCounter> = OnceLock::new();

// ========================================================================
// Histograms
// ========================================================================

/// SQL statements per flush transaction.
pub static CVR_FLUSH_STATEMENTS: OnceLock<Histogram> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at server startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(CVR_LOADS, IntCounter::new("cvr_loads_total", "CVR snapshot loads"));
    register!(CVR_FLUSHES, IntCounter::new("cvr_flushes_total", "Successful CVR flushes"));
    register!(CVR_ROWS_FLUSHED, IntCounter::new("cvr_rows_flushed_total", "Row records written by flushes"));
    register!(CVR_FLUSH_ERRORS, IntCounterVec::new(Opts::new("cvr_flush_errors_total", "Flush failures by error code"), &["error"]));
    register!(CVR_GROUPS_PURGED, IntCounter::new("cvr_groups_purged_total", "Client groups deleted by the purger"));
    register!(CVR_FLUSH_STATEMENTS, Histogram::with_opts(
        HistogramOpts::new("cvr_flush_statements", "SQL statements per flush transaction")
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0])));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Helper functions for CVR metric updates
// ============================================================================

/// Record a successful flush.
#[inline]
pub fn record_flush(stats: &CvrFlushStats) {
    if let Some(c) = CVR_FLUSHES.get() {
        c.inc();
    }
    if let Some(c) = CVR_ROWS_FLUSHED.get() {
        c.inc_by(stats.rows as u64);
    }
    if let Some(h) = CVR_FLUSH_STATEMENTS.get() {
        h.observe(stats.statements as f64);
    }
}

/// Record a failed flush by error code.
#[inline]
pub fn record_flush_error(error: &str) {
    if let Some(c) = CVR_FLUSH_ERRORS.get() {
        c.with_label_values(&[error]).inc();
    }
}

/// Record a purged client group.
#[inline]
pub fn record_purged_group() {
    if let Some(c) = CVR_GROUPS_PURGED.get() {
        c.inc();
    }
}
