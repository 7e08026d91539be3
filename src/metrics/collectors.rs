//! High-level recording helpers over the raw Prometheus metrics.
//!
//! `MetricsCollector` keeps label values consistent across the orchestrator.
//! Every method is a no-op until [`super::init_metrics`] has run.

use std::time::Duration;

use super::prometheus::{
    CURATED_SAMPLES_TOTAL, CURATION_DURATION, JOBS_IN_PROGRESS, JOBS_TOTAL, STAGE_DURATION,
    STAGE_FAILURES_TOTAL, STORAGE_BYTES_TOTAL,
};
use crate::error::ErrorKind;
use crate::scheduler::JobStatus;
use crate::stage::Stage;

/// Metrics collector for orchestrator events.
///
/// # Example
///
/// ```ignore
/// use capforge::metrics::{init_metrics, MetricsCollector};
/// use capforge::stage::Stage;
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_stage_completed(Stage::Extraction, Duration::from_secs(42), 100 << 20);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a stage that committed its output.
    pub fn record_stage_completed(&self, stage: Stage, elapsed: Duration, bytes: u64) {
        if let Some(stage_duration) = STAGE_DURATION.get() {
            stage_duration
                .with_label_values(&[stage.label()])
                .observe(elapsed.as_secs_f64());
        }

        if let Some(storage) = STORAGE_BYTES_TOTAL.get() {
            storage
                .with_label_values(&[stage.label()])
                .inc_by(bytes as f64);
        }

        tracing::trace!(
            stage = %stage,
            elapsed_secs = elapsed.as_secs_f64(),
            bytes = bytes,
            "Recorded stage metric"
        );
    }

    /// Record a fatal stage failure.
    pub fn record_stage_failure(&self, stage: Stage, kind: ErrorKind) {
        if let Some(failures) = STAGE_FAILURES_TOTAL.get() {
            failures
                .with_label_values(&[stage.label(), kind.label()])
                .inc();
        }

        tracing::trace!(stage = %stage, kind = %kind, "Recorded stage failure metric");
    }

    /// Record a job that reached a terminal status.
    pub fn record_job_finished(&self, status: JobStatus) {
        if let Some(jobs) = JOBS_TOTAL.get() {
            jobs.with_label_values(&[&status.to_string()]).inc();
        }

        tracing::trace!(status = %status, "Recorded job metric");
    }

    /// Record a finished diversity selection.
    pub fn record_curation(&self, samples: usize, elapsed: Duration) {
        if let Some(curated) = CURATED_SAMPLES_TOTAL.get() {
            curated.inc_by(samples as f64);
        }

        if let Some(duration) = CURATION_DURATION.get() {
            duration.observe(elapsed.as_secs_f64());
        }

        tracing::trace!(
            samples = samples,
            elapsed_secs = elapsed.as_secs_f64(),
            "Recorded curation metric"
        );
    }

    /// Increment the count of jobs in progress by 1.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Decrement the count of jobs in progress by 1.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_record_stage_metrics() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_stage_completed(Stage::Extraction, Duration::from_secs(30), 1024);
        collector.record_stage_failure(Stage::Reconstruction, ErrorKind::Reconstruction);

        let exported = export_metrics();
        assert!(exported.contains("capforge_stage_duration_seconds"));
        assert!(exported.contains("stage=\"reconstruction\""));
    }

    #[test]
    fn test_record_job_and_curation() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.inc_jobs_in_progress();
        collector.record_curation(50, Duration::from_millis(120));
        collector.record_job_finished(JobStatus::Completed);
        collector.dec_jobs_in_progress();

        assert!(export_metrics().contains("status=\"completed\""));
    }
}
