//! capforge: job orchestration for stereo-capture processing.
//!
//! This library sequences capture jobs through extraction, segmentation,
//! reconstruction and tracking, tracks their throughput, storage and
//! failures, and curates diverse, budget-limited datasets from the results.

// Core modules
pub mod artifact;
pub mod diversity;
pub mod error;
pub mod metering;
pub mod metrics;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod stage;
pub mod telemetry;

// Re-export commonly used types
pub use error::{
    ErrorKind, ErrorRecord, OrchestratorError, OrchestratorResult, StageError, StageVerdict,
};
pub use pipeline::{Orchestrator, OrchestratorConfig};
pub use scheduler::{JobId, JobSpec, JobStatus, JobStatusReport};
pub use stage::{Stage, StageRegistry, StageRunner};
