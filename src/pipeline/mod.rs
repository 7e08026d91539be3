//! Job orchestration for capture processing.
//!
//! # Architecture
//!
//! - **Orchestrator**: validates job requests, runs each job's stages in
//!   order on its own worker, classifies failures, meters committed output
//!   and hands finished jobs to curation
//! - **Config**: concurrency, retry, progress and curation settings
//!
//! # Job Flow
//!
//! 1. **Creation**: `create_job` validates the stage selection and source
//!    artifact and registers a `pending` job
//! 2. **Execution**: `run_job` (or `spawn_job`) executes the selected stages
//!    strictly in canonical order, each consuming the previous commit
//! 3. **Metering**: each committed stage output adds its bytes to
//!    `storage_size_bytes` exactly once
//! 4. **Curation**: if requested, a diverse, budget-limited dataset is
//!    selected from the job's candidate pool
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use capforge::pipeline::{Orchestrator, OrchestratorConfig};
//! use capforge::scheduler::JobSpec;
//! use capforge::stage::{Stage, StageRegistry};
//!
//! let registry = StageRegistry::new()
//!     .register(Stage::Extraction, Arc::new(MyExtractor))
//!     .register(Stage::Segmentation, Arc::new(MySegmenter));
//! let orchestrator = Arc::new(Orchestrator::new(OrchestratorConfig::from_env()?, registry)?);
//!
//! let job_id = orchestrator.create_job(JobSpec::new(
//!     [Stage::Extraction, Stage::Segmentation],
//!     Artifact::new(ArtifactKind::Capture, "/captures/session-01.svo"),
//! ))?;
//! let report = orchestrator.spawn_job(job_id).await??;
//! println!("{} finished as {}", report.job_id, report.status);
//! ```

pub mod config;
pub mod orchestrator;

pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::Orchestrator;
