//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks job outcomes, per-stage durations and failures, committed storage
//! and curation throughput.
//!
//! # Example
//!
//! ```ignore
//! use capforge::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! // ... run jobs ...
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    CURATED_SAMPLES_TOTAL, CURATION_DURATION, JOBS_IN_PROGRESS, JOBS_TOTAL, REGISTRY,
    STAGE_DURATION, STAGE_FAILURES_TOTAL, STORAGE_BYTES_TOTAL,
};
