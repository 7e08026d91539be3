//! Processing jobs and their lifecycle.
//!
//! A job drives one capture through its selected stages:
//!
//! ```text
//! pending -> running(stage_1 -> ... -> stage_n [-> curating]) -> completed
//!                 \-> failed
//!    \-----------------\-> cancelled
//! ```
//!
//! Every transition is a method on [`ProcessingJob`] that either applies
//! fully or leaves the job untouched. Terminal jobs are immutable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::Artifact;
use crate::diversity::{DatasetId, SelectionBudget};
use crate::error::{ErrorRecord, OrchestratorError, OrchestratorResult};
use crate::metering::StorageMeter;
use crate::progress::{CurrentStageProgress, EtaEstimate, RateEstimator};
use crate::stage::{Stage, StageConfig, StageSet};

/// Unique job identifier, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Completed, failed and cancelled are final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Request to create a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Requested stages, validated into a [`StageSet`] at creation.
    pub stages: Vec<Stage>,
    /// Artifact fed to the first selected stage.
    pub source: Artifact,
    /// Optional per-stage parameters.
    pub stage_configs: BTreeMap<Stage, StageConfig>,
    /// Curate a dataset after the last stage, within this budget.
    pub curation: Option<SelectionBudget>,
}

impl JobSpec {
    /// Request for `stages`, fed by `source`. Stage order does not matter.
    pub fn new(stages: impl IntoIterator<Item = Stage>, source: Artifact) -> Self {
        Self {
            stages: stages.into_iter().collect(),
            source,
            stage_configs: BTreeMap::new(),
            curation: None,
        }
    }

    /// Sets the parameters for one stage.
    pub fn with_stage_config(mut self, stage: Stage, config: StageConfig) -> Self {
        self.stage_configs.insert(stage, config);
        self
    }

    /// Requests dataset curation once production stages complete.
    pub fn with_curation(mut self, budget: SelectionBudget) -> Self {
        self.curation = Some(budget);
        self
    }
}

/// An artifact committed by a stage of this job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedArtifact {
    pub stage: Stage,
    pub artifact: Artifact,
    pub committed_at: DateTime<Utc>,
}

/// Outcome of [`ProcessingJob::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The next selected stage is now current.
    Next(Stage),
    /// All stages are done and curation must run before completion.
    Curate,
    /// All stages are done and the job is completed.
    Completed,
}

/// Transient progress of the executing stage. Not persisted.
#[derive(Debug, Clone, Default)]
struct StageProgress {
    units_done: u64,
    total_units: Option<u64>,
    rate: RateEstimator,
}

/// A capture-processing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    id: JobId,
    stages_to_run: StageSet,
    source: Artifact,
    #[serde(default)]
    stage_configs: BTreeMap<Stage, StageConfig>,
    #[serde(default)]
    curation: Option<SelectionBudget>,
    status: JobStatus,
    current_stage: Option<Stage>,
    stage_started_at: Option<DateTime<Utc>>,
    frames_per_second: Option<f64>,
    #[serde(flatten)]
    storage: StorageMeter,
    last_completed_stage: Option<Stage>,
    #[serde(default)]
    artifacts: Vec<CommittedArtifact>,
    error: Option<ErrorRecord>,
    dataset_id: Option<DatasetId>,
    resumed_from: Option<JobId>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    progress: StageProgress,
}

impl ProcessingJob {
    /// Creates a pending job. The stage selection must already be validated.
    pub fn new(
        stages_to_run: StageSet,
        source: Artifact,
        rate_window: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            stages_to_run,
            source,
            stage_configs: BTreeMap::new(),
            curation: None,
            status: JobStatus::Pending,
            current_stage: None,
            stage_started_at: None,
            frames_per_second: None,
            storage: StorageMeter::new(),
            last_completed_stage: None,
            artifacts: Vec::new(),
            error: None,
            dataset_id: None,
            resumed_from: None,
            created_at,
            finished_at: None,
            progress: StageProgress {
                rate: RateEstimator::new(rate_window),
                ..StageProgress::default()
            },
        }
    }

    /// Sets per-stage parameters.
    pub fn with_stage_configs(mut self, configs: BTreeMap<Stage, StageConfig>) -> Self {
        self.stage_configs = configs;
        self
    }

    /// Sets the curation budget run after the last stage.
    pub fn with_curation(mut self, curation: Option<SelectionBudget>) -> Self {
        self.curation = curation;
        self
    }

    /// Marks this job as resuming `original`.
    pub fn resumed_from_job(mut self, original: JobId) -> Self {
        self.resumed_from = Some(original);
        self
    }

    // -- accessors -------------------------------------------------------

    /// Unique job identifier.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Stages this job runs, in canonical order.
    pub fn stages_to_run(&self) -> &StageSet {
        &self.stages_to_run
    }

    /// Artifact the first selected stage consumes.
    pub fn source(&self) -> &Artifact {
        &self.source
    }

    /// Parameters for `stage`, or empty parameters when none were given.
    pub fn stage_config(&self, stage: Stage) -> StageConfig {
        self.stage_configs.get(&stage).cloned().unwrap_or_default()
    }

    /// Every per-stage parameter set given at creation.
    pub fn stage_configs(&self) -> &BTreeMap<Stage, StageConfig> {
        &self.stage_configs
    }

    /// Curation budget, when the job curates a dataset after its last stage.
    pub fn curation(&self) -> Option<&SelectionBudget> {
        self.curation.as_ref()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Executing stage. `None` unless running a stage.
    pub fn current_stage(&self) -> Option<Stage> {
        self.current_stage
    }

    /// When the executing stage started.
    pub fn stage_started_at(&self) -> Option<DateTime<Utc>> {
        self.stage_started_at
    }

    /// Smoothed throughput of the executing stage, once known.
    pub fn frames_per_second(&self) -> Option<f64> {
        self.frames_per_second
    }

    /// Bytes committed by all completed stages.
    pub fn storage_size_bytes(&self) -> u64 {
        self.storage.total()
    }

    /// Per-stage storage accounting.
    pub fn storage(&self) -> &StorageMeter {
        &self.storage
    }

    /// Most recent stage whose output was committed.
    pub fn last_completed_stage(&self) -> Option<Stage> {
        self.last_completed_stage
    }

    /// Committed stage outputs, in commit order.
    pub fn artifacts(&self) -> &[CommittedArtifact] {
        &self.artifacts
    }

    /// Artifact committed by `stage`, if it completed in this job.
    pub fn artifact_for(&self, stage: Stage) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|committed| committed.stage == stage)
            .map(|committed| &committed.artifact)
    }

    /// Most recent committed artifact, falling back to the source.
    pub fn latest_artifact(&self) -> &Artifact {
        self.artifacts
            .last()
            .map(|committed| &committed.artifact)
            .unwrap_or(&self.source)
    }

    /// Failure record of a failed job.
    pub fn error(&self) -> Option<&ErrorRecord> {
        self.error.as_ref()
    }

    /// Dataset curated by this job, once completed.
    pub fn dataset_id(&self) -> Option<DatasetId> {
        self.dataset_id
    }

    /// Job this one was resumed from.
    pub fn resumed_from(&self) -> Option<JobId> {
        self.resumed_from
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time the job reached a terminal status.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// True while all stages are done and curation is in progress.
    pub fn is_curating(&self) -> bool {
        self.status == JobStatus::Running && self.current_stage.is_none()
    }

    /// Progress of the executing stage, if any.
    pub fn current_progress(&self) -> Option<CurrentStageProgress> {
        self.current_stage.map(|_| CurrentStageProgress {
            units_done: self.progress.units_done,
            total_units: self.progress.total_units,
            rate: self.frames_per_second,
        })
    }

    /// Selected stages that have not started yet.
    pub fn pending_stages(&self) -> Vec<Stage> {
        match (self.status, self.current_stage) {
            (JobStatus::Pending, _) => self.stages_to_run.iter().collect(),
            (JobStatus::Running, Some(current)) => self.stages_to_run.remaining_after(current),
            _ => Vec::new(),
        }
    }

    // -- transitions -----------------------------------------------------

    fn reject(&self, operation: &'static str) -> OrchestratorError {
        OrchestratorError::JobState {
            job_id: self.id,
            status: self.status,
            operation,
        }
    }

    /// Points the status group at `stage` (or at nothing) as of `at`.
    fn enter_stage(&mut self, stage: Option<Stage>, at: DateTime<Utc>) {
        self.current_stage = stage;
        self.stage_started_at = Some(at);
        self.frames_per_second = None;
        self.progress.units_done = 0;
        self.progress.total_units = None;
        self.progress.rate.restart(0, at);
    }

    fn go_idle(&mut self, status: JobStatus, at: DateTime<Utc>) {
        self.status = status;
        self.current_stage = None;
        self.stage_started_at = None;
        self.frames_per_second = None;
        self.progress.rate.reset();
        self.finished_at = Some(at);
    }

    /// `pending -> running`, entering the first selected stage.
    pub fn start(&mut self, at: DateTime<Utc>) -> OrchestratorResult<Stage> {
        if self.status != JobStatus::Pending {
            return Err(self.reject("start"));
        }
        let first = self.stages_to_run.first();
        self.status = JobStatus::Running;
        self.enter_stage(Some(first), at);
        Ok(first)
    }

    /// Commits the current stage's output and moves to the next stage.
    ///
    /// Metering happens here and only here, on a fully committed output.
    pub fn advance(
        &mut self,
        completed: Stage,
        artifact: Artifact,
        bytes_written: u64,
        at: DateTime<Utc>,
    ) -> OrchestratorResult<Advance> {
        if self.status != JobStatus::Running || self.current_stage != Some(completed) {
            return Err(self.reject("advance"));
        }

        self.storage.commit(completed, bytes_written)?;
        self.artifacts.push(CommittedArtifact {
            stage: completed,
            artifact,
            committed_at: at,
        });
        self.last_completed_stage = Some(completed);

        match self.stages_to_run.next_after(completed) {
            Some(next) => {
                self.enter_stage(Some(next), at);
                Ok(Advance::Next(next))
            }
            None if self.curation.is_some() => {
                self.enter_stage(None, at);
                Ok(Advance::Curate)
            }
            None => {
                self.go_idle(JobStatus::Completed, at);
                Ok(Advance::Completed)
            }
        }
    }

    /// `running(curating) -> completed`, linking the curated dataset.
    pub fn complete_curation(
        &mut self,
        dataset_id: DatasetId,
        at: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        if !self.is_curating() {
            return Err(self.reject("complete curation of"));
        }
        self.dataset_id = Some(dataset_id);
        self.go_idle(JobStatus::Completed, at);
        Ok(())
    }

    /// `running -> failed`, keeping committed outputs for diagnosis.
    pub fn fail(&mut self, error: ErrorRecord, at: DateTime<Utc>) -> OrchestratorResult<()> {
        if self.status != JobStatus::Running {
            return Err(self.reject("fail"));
        }
        self.error = Some(error);
        self.go_idle(JobStatus::Failed, at);
        Ok(())
    }

    /// `pending | running -> cancelled`.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> OrchestratorResult<()> {
        if self.status.is_terminal() {
            return Err(self.reject("cancel"));
        }
        self.go_idle(JobStatus::Cancelled, at);
        Ok(())
    }

    /// Sets the expected unit count of the executing stage.
    pub fn set_total_units(&mut self, stage: Stage, total: u64) -> bool {
        if self.status != JobStatus::Running || self.current_stage != Some(stage) {
            return false;
        }
        self.progress.total_units = Some(total);
        true
    }

    /// Records cumulative progress of the executing stage.
    ///
    /// The rate and unit counter change together; reports for a stage that
    /// is no longer current are ignored.
    pub fn record_progress(&mut self, stage: Stage, units_done: u64, at: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running || self.current_stage != Some(stage) {
            return false;
        }
        self.progress.units_done = units_done;
        self.frames_per_second = self.progress.rate.observe(units_done, at);
        true
    }

    /// Units completed so far in the executing stage.
    pub fn units_done(&self) -> u64 {
        self.progress.units_done
    }
}

/// Consistent view of a job for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub current_stage: Option<Stage>,
    pub stage_started_at: Option<DateTime<Utc>>,
    pub frames_per_second: Option<f64>,
    pub storage_size_bytes: u64,
    pub last_completed_stage: Option<Stage>,
    pub eta_estimate: EtaEstimate,
    pub error: Option<ErrorRecord>,
    pub dataset_id: Option<DatasetId>,
}

impl JobStatusReport {
    /// Snapshot of `job` with a precomputed ETA.
    pub fn from_job(job: &ProcessingJob, eta_estimate: EtaEstimate) -> Self {
        Self {
            job_id: job.id(),
            status: job.status(),
            current_stage: job.current_stage(),
            stage_started_at: job.stage_started_at(),
            frames_per_second: job.frames_per_second(),
            storage_size_bytes: job.storage_size_bytes(),
            last_completed_stage: job.last_completed_stage(),
            eta_estimate,
            error: job.error().cloned(),
            dataset_id: job.dataset_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;
    use crate::error::ErrorKind;

    const MB: u64 = 1024 * 1024;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
    }

    fn job(stages: &[Stage]) -> ProcessingJob {
        let set = StageSet::new(stages.iter().copied()).expect("valid stages");
        let source = Artifact::new(set.first().input_kind(), "/data/capture.svo");
        ProcessingJob::new(set, source, 10, ts(0))
    }

    fn output(stage: Stage) -> Artifact {
        Artifact::new(stage.output_kind(), format!("/data/out/{}", stage))
    }

    #[test]
    fn test_new_job_is_pending_and_idle() {
        let job = job(&[Stage::Extraction]);
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.current_stage(), None);
        assert_eq!(job.stage_started_at(), None);
        assert_eq!(job.storage_size_bytes(), 0);
        assert_eq!(job.pending_stages(), vec![Stage::Extraction]);
    }

    #[test]
    fn test_start_enters_first_stage() {
        let mut job = job(&[Stage::Segmentation, Stage::Reconstruction]);
        assert_eq!(job.start(ts(1)).expect("start"), Stage::Segmentation);
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.current_stage(), Some(Stage::Segmentation));
        assert_eq!(job.stage_started_at(), Some(ts(1)));
    }

    #[test]
    fn test_start_twice_rejected() {
        let mut job = job(&[Stage::Extraction]);
        job.start(ts(1)).expect("start");
        let err = job.start(ts(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::JobState);
    }

    #[test]
    fn test_advance_through_stages_to_completion() {
        let mut job = job(&[Stage::Extraction, Stage::Segmentation]);
        job.start(ts(0)).expect("start");

        let step = job
            .advance(Stage::Extraction, output(Stage::Extraction), 100 * MB, ts(10))
            .expect("advance");
        assert_eq!(step, Advance::Next(Stage::Segmentation));
        assert_eq!(job.current_stage(), Some(Stage::Segmentation));
        assert_eq!(job.stage_started_at(), Some(ts(10)));
        assert_eq!(job.storage_size_bytes(), 100 * MB);

        let step = job
            .advance(Stage::Segmentation, output(Stage::Segmentation), 5 * MB, ts(20))
            .expect("advance");
        assert_eq!(step, Advance::Completed);
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.current_stage(), None);
        assert_eq!(job.stage_started_at(), None);
        assert_eq!(job.storage_size_bytes(), 105 * MB);
        assert_eq!(job.last_completed_stage(), Some(Stage::Segmentation));
        assert_eq!(job.finished_at(), Some(ts(20)));
    }

    #[test]
    fn test_advance_wrong_stage_rejected_without_metering() {
        let mut job = job(&[Stage::Extraction, Stage::Segmentation]);
        job.start(ts(0)).expect("start");
        assert!(job
            .advance(Stage::Segmentation, output(Stage::Segmentation), 10, ts(1))
            .is_err());
        assert_eq!(job.storage_size_bytes(), 0);
        assert_eq!(job.current_stage(), Some(Stage::Extraction));
    }

    #[test]
    fn test_advance_with_curation_enters_curating() {
        let budget = SelectionBudget::new(Some(10), None).expect("budget");
        let mut job = job(&[Stage::Tracking]).with_curation(Some(budget));
        job.start(ts(0)).expect("start");
        let step = job
            .advance(Stage::Tracking, output(Stage::Tracking), 1, ts(5))
            .expect("advance");
        assert_eq!(step, Advance::Curate);
        assert!(job.is_curating());
        assert_eq!(job.status(), JobStatus::Running);

        let dataset = DatasetId::new();
        job.complete_curation(dataset, ts(6)).expect("complete");
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.dataset_id(), Some(dataset));
    }

    #[test]
    fn test_fail_retains_outputs() {
        let mut job = job(&[Stage::Extraction, Stage::Segmentation]);
        job.start(ts(0)).expect("start");
        job.advance(Stage::Extraction, output(Stage::Extraction), 100 * MB, ts(1))
            .expect("advance");

        let record = ErrorRecord::new(ErrorKind::Model, Some(Stage::Segmentation), "gpu lost");
        job.fail(record, ts(2)).expect("fail");
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.current_stage(), None);
        assert_eq!(job.storage_size_bytes(), 100 * MB);
        assert_eq!(job.error().map(|e| e.stage), Some(Some(Stage::Segmentation)));
        assert!(job.artifact_for(Stage::Extraction).is_some());
    }

    #[test]
    fn test_cancel_pending_and_terminal_immutability() {
        let mut job = job(&[Stage::Extraction]);
        job.cancel(ts(1)).expect("cancel pending");
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(job.cancel(ts(2)).is_err());
        assert!(job.start(ts(2)).is_err());
        let record = ErrorRecord::new(ErrorKind::Input, None, "late");
        assert!(job.fail(record, ts(3)).is_err());
        assert_eq!(job.error(), None);
    }

    #[test]
    fn test_progress_updates_rate_and_is_reset_on_transition() {
        let mut job = job(&[Stage::Extraction, Stage::Segmentation]);
        job.start(ts(0)).expect("start");
        assert!(job.set_total_units(Stage::Extraction, 100));
        for second in 1..=3 {
            job.record_progress(Stage::Extraction, 10 * second as u64, ts(second));
        }
        let fps = job.frames_per_second().expect("rate known");
        assert!((fps - 10.0).abs() < 1e-9);
        assert_eq!(job.units_done(), 30);

        job.advance(Stage::Extraction, output(Stage::Extraction), 1, ts(4))
            .expect("advance");
        assert_eq!(job.frames_per_second(), None);
        assert_eq!(job.units_done(), 0);
        assert!(!job.record_progress(Stage::Extraction, 50, ts(5)));
    }

    #[test]
    fn test_pending_stages_while_running() {
        let mut job = job(&[Stage::Extraction, Stage::Segmentation, Stage::Reconstruction]);
        job.start(ts(0)).expect("start");
        assert_eq!(
            job.pending_stages(),
            vec![Stage::Segmentation, Stage::Reconstruction]
        );
    }

    #[test]
    fn test_serialized_record_has_persisted_fields() {
        let mut job = job(&[Stage::Extraction]);
        job.start(ts(0)).expect("start");
        let json = serde_json::to_value(&job).expect("serialize");
        for field in [
            "id",
            "stages_to_run",
            "status",
            "current_stage",
            "stage_started_at",
            "frames_per_second",
            "storage_size_bytes",
            "error",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(json["status"], "running");
        assert_eq!(json["stages_to_run"][0], "extraction");
        assert_eq!(json["source"]["kind"], "capture");

        let restored: ProcessingJob = serde_json::from_value(json).expect("deserialize");
        assert_eq!(restored.id(), job.id());
        assert_eq!(restored.current_stage(), Some(Stage::Extraction));
        assert_eq!(ArtifactKind::Capture, restored.source().kind);
    }
}
