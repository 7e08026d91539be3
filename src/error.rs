//! Error types for capforge operations.
//!
//! Failures are split by where they originate:
//! - `StageError`: raised inside a stage implementation (raw, unclassified)
//! - `ErrorRecord`: the structured, persisted form of a fatal stage or curation failure
//! - `OrchestratorError`: rejections returned by the orchestrator API
//!
//! Every failure maps onto an [`ErrorKind`], the single discriminant the job
//! state machine and any storage layer work with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diversity::CurationError;
use crate::metering::MeteringError;
use crate::scheduler::{JobId, JobStatus};
use crate::stage::{Stage, StageSetError};

/// Failure category shared by every error in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or unreadable source artifact. Never retried.
    Input,
    /// Inference backend failure. Retried inside the stage, fatal once exhausted.
    Model,
    /// Extraction or segmentation processing failure.
    Processing,
    /// Reconstruction failure. Partial 3D output is never accepted.
    Reconstruction,
    /// Tracking failure. Partial trajectories are never accepted.
    Tracking,
    /// Failure producing the curated dataset.
    Export,
    /// Operation requested against an incompatible job status.
    JobState,
    /// Invalid stage selection or budget parameters.
    Configuration,
}

impl ErrorKind {
    /// Returns true for failures a stage may retry on its own.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Model)
    }

    /// Stable label used in logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::Model => "model",
            ErrorKind::Processing => "processing",
            ErrorKind::Reconstruction => "reconstruction",
            ErrorKind::Tracking => "tracking",
            ErrorKind::Export => "export",
            ErrorKind::JobState => "job_state",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors raised by a stage implementation.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Malformed input artifact: {0}")]
    MalformedInput(String),

    #[error("Failed to load model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Stage cancelled")]
    Cancelled,

    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<StageError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Whether the stage's retry policy may attempt the work again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::ModelLoad { .. } | StageError::Inference(_))
    }

    /// Maps this error onto the taxonomy for the stage that raised it.
    ///
    /// Returns `None` for cancellation, which is not a failure.
    pub fn kind_for(&self, stage: Stage) -> Option<ErrorKind> {
        match self {
            StageError::MalformedInput(_) | StageError::Io(_) => Some(ErrorKind::Input),
            StageError::ModelLoad { .. } | StageError::Inference(_) => Some(ErrorKind::Model),
            StageError::RetriesExhausted { last, .. } => last.kind_for(stage),
            StageError::Processing(_) => Some(match stage {
                Stage::Reconstruction => ErrorKind::Reconstruction,
                Stage::Tracking => ErrorKind::Tracking,
                Stage::Extraction | Stage::Segmentation => ErrorKind::Processing,
            }),
            StageError::Cancelled => None,
        }
    }
}

/// Structured failure record persisted on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Failure category.
    pub kind: ErrorKind,
    /// Stage that failed, `None` for curation/export failures.
    pub stage: Option<Stage>,
    /// Human readable message.
    pub message: String,
    /// Kind-specific payload (attempt counts, model names, ...).
    #[serde(default)]
    pub details: serde_json::Value,
    /// When the failure was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    /// Creates a record with an empty details payload.
    pub fn new(kind: ErrorKind, stage: Option<Stage>, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            details: serde_json::Value::Null,
            occurred_at: Utc::now(),
        }
    }

    /// Attaches a details payload.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Record for a failure while building the curated dataset.
    pub fn export(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Export, None, message)
    }
}

/// Verdict produced at the stage boundary. The state machine only sees this.
#[derive(Debug, Clone, PartialEq)]
pub enum StageVerdict {
    /// The stage failed for good; the job must fail with this record.
    Fatal(ErrorRecord),
    /// The stage stopped because cancellation was requested.
    Cancelled,
}

/// Classifies a stage failure into a verdict and persisted record.
///
/// Retryable errors are expected to have been retried by the stage already;
/// one that still reaches this point is treated as a single failed attempt.
pub fn classify(stage: Stage, err: &StageError) -> StageVerdict {
    let Some(kind) = err.kind_for(stage) else {
        return StageVerdict::Cancelled;
    };

    let details = match err {
        StageError::RetriesExhausted { attempts, last } => serde_json::json!({
            "attempts": attempts,
            "last_error": last.to_string(),
        }),
        StageError::ModelLoad { model, .. } => serde_json::json!({
            "attempts": 1,
            "model": model,
        }),
        StageError::Inference(_) => serde_json::json!({ "attempts": 1 }),
        StageError::Io(io) => serde_json::json!({ "io_kind": io.kind().to_string() }),
        _ => serde_json::Value::Null,
    };

    StageVerdict::Fatal(ErrorRecord::new(kind, Some(stage), err.to_string()).with_details(details))
}

/// Errors returned by the orchestrator API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Cannot {operation} job {job_id} while it is {status}")]
    JobState {
        job_id: JobId,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid stage selection: {0}")]
    StageSelection(#[from] StageSetError),

    #[error("Curation error: {0}")]
    Curation(#[from] CurationError),

    #[error("Metering error: {0}")]
    Metering(#[from] MeteringError),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Worker failed: {0}")]
    Worker(String),
}

impl OrchestratorError {
    /// Maps the rejection onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotFound(_)
            | OrchestratorError::JobState { .. }
            | OrchestratorError::Metering(_) => ErrorKind::JobState,
            OrchestratorError::Configuration(_) | OrchestratorError::StageSelection(_) => {
                ErrorKind::Configuration
            }
            OrchestratorError::Curation(err) => err.kind(),
            OrchestratorError::Export(_) | OrchestratorError::Worker(_) => ErrorKind::Export,
        }
    }
}

impl From<tokio::task::JoinError> for OrchestratorError {
    fn from(err: tokio::task::JoinError) -> Self {
        OrchestratorError::Worker(err.to_string())
    }
}

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_error_kind_depends_on_stage() {
        let err = StageError::Processing("bad disparity".to_string());
        assert_eq!(
            err.kind_for(Stage::Reconstruction),
            Some(ErrorKind::Reconstruction)
        );
        assert_eq!(err.kind_for(Stage::Tracking), Some(ErrorKind::Tracking));
        assert_eq!(err.kind_for(Stage::Extraction), Some(ErrorKind::Processing));
    }

    #[test]
    fn test_only_model_errors_are_retryable() {
        assert!(StageError::Inference("timeout".into()).is_retryable());
        assert!(StageError::ModelLoad {
            model: "sam".into(),
            reason: "missing weights".into()
        }
        .is_retryable());
        assert!(!StageError::MalformedInput("truncated".into()).is_retryable());
        assert!(!StageError::Processing("nan".into()).is_retryable());
        assert!(ErrorKind::Model.is_retryable());
        assert!(!ErrorKind::Input.is_retryable());
    }

    #[test]
    fn test_classify_exhausted_retries_is_fatal_model_error() {
        let err = StageError::RetriesExhausted {
            attempts: 3,
            last: Box::new(StageError::Inference("gpu lost".into())),
        };
        match classify(Stage::Segmentation, &err) {
            StageVerdict::Fatal(record) => {
                assert_eq!(record.kind, ErrorKind::Model);
                assert_eq!(record.stage, Some(Stage::Segmentation));
                assert_eq!(record.details["attempts"], 3);
            }
            other => panic!("expected fatal verdict, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_cancelled() {
        assert_eq!(
            classify(Stage::Tracking, &StageError::Cancelled),
            StageVerdict::Cancelled
        );
    }

    #[test]
    fn test_io_error_is_input_error() {
        let err: StageError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "capture.svo").into();
        match classify(Stage::Extraction, &err) {
            StageVerdict::Fatal(record) => assert_eq!(record.kind, ErrorKind::Input),
            other => panic!("expected fatal verdict, got {:?}", other),
        }
    }

    #[test]
    fn test_error_record_serializes_kind_snake_case() {
        let record = ErrorRecord::new(ErrorKind::JobState, None, "nope");
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["kind"], "job_state");
    }
}
