//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by capforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all capforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that reached a terminal status, labeled by status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs currently executing stages or curating.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Stage execution duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Fatal stage failures, labeled by stage and error kind.
pub static STAGE_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Bytes committed by completed stages, labeled by stage.
pub static STORAGE_BYTES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Samples selected into curated datasets.
pub static CURATED_SAMPLES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Diversity selection duration in seconds.
pub static CURATION_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording helpers are no-ops until this has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("capforge_jobs_total", "Jobs that reached a terminal status"),
        &["status"],
    )?;

    let jobs_in_progress = Gauge::new(
        "capforge_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    // Stage metrics
    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "capforge_stage_duration_seconds",
            "Stage execution duration in seconds",
        )
        .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
        &["stage"],
    )?;

    let stage_failures_total = CounterVec::new(
        Opts::new("capforge_stage_failures_total", "Fatal stage failures"),
        &["stage", "kind"],
    )?;

    let storage_bytes_total = CounterVec::new(
        Opts::new(
            "capforge_storage_bytes_total",
            "Bytes committed by completed stages",
        ),
        &["stage"],
    )?;

    // Curation metrics
    let curated_samples_total = Counter::new(
        "capforge_curated_samples_total",
        "Samples selected into curated datasets",
    )?;

    let curation_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "capforge_curation_duration_seconds",
            "Diversity selection duration in seconds",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(stage_failures_total.clone()))?;
    registry.register(Box::new(storage_bytes_total.clone()))?;
    registry.register(Box::new(curated_samples_total.clone()))?;
    registry.register(Box::new(curation_duration.clone()))?;

    // Already-set statics mean an earlier call won; keep those.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = STAGE_FAILURES_TOTAL.set(stage_failures_total);
    let _ = STORAGE_BYTES_TOTAL.set(storage_bytes_total);
    let _ = CURATED_SAMPLES_TOTAL.set(curated_samples_total);
    let _ = CURATION_DURATION.set(curation_duration);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
