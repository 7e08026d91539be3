//! Job lifecycle and the job registry.
//!
//! - **ProcessingJob**: one capture's path through its selected stages, with
//!   the `start` / `advance` / `fail` / `cancel` transitions
//! - **JobStore**: arena of job records addressed by [`JobId`], updated
//!   atomically per job and observable through status watch channels
//!
//! The orchestrator in [`crate::pipeline`] is the only writer in normal
//! operation; status queries read snapshots concurrently.

pub mod job;
pub mod store;

pub use job::{
    Advance, CommittedArtifact, JobId, JobSpec, JobStatus, JobStatusReport, ProcessingJob,
};
pub use store::JobStore;
