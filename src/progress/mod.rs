//! Progress tracking: throughput, ETA projection and periodic reporting.

pub mod eta;
pub mod monitor;

pub use eta::{
    project_eta, CurrentStageProgress, EtaEstimate, RateEstimator, StageDurationHistory,
    DEFAULT_RATE_WINDOW,
};
pub use monitor::{JobCounts, ProgressMonitor};
