//! Pipeline stages and the contract every stage implementation fulfils.
//!
//! The stage order is fixed: extraction, segmentation, reconstruction,
//! tracking. A job selects a contiguous subset of that order ([`StageSet`]);
//! sequencing is a pure function of the canonical table and the subset.
//!
//! Stage implementations are external collaborators behind [`StageRunner`].
//! They receive the previous stage's committed artifact and a
//! [`StageContext`] through which they report progress and observe
//! cancellation between units of work.

pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::artifact::{Artifact, ArtifactKind};
use crate::error::StageError;
use crate::scheduler::JobId;

pub use retry::{RetryPolicy, RetryingStage};

/// A discrete transformation step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Segmentation,
    Reconstruction,
    Tracking,
}

/// Canonical execution order.
pub const CANONICAL_ORDER: [Stage; 4] = [
    Stage::Extraction,
    Stage::Segmentation,
    Stage::Reconstruction,
    Stage::Tracking,
];

impl Stage {
    /// The stage label used in records, events and logging.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Segmentation => "segmentation",
            Stage::Reconstruction => "reconstruction",
            Stage::Tracking => "tracking",
        }
    }

    /// Index in [`CANONICAL_ORDER`].
    pub fn position(self) -> usize {
        match self {
            Stage::Extraction => 0,
            Stage::Segmentation => 1,
            Stage::Reconstruction => 2,
            Stage::Tracking => 3,
        }
    }

    /// Artifact kind this stage consumes.
    pub fn input_kind(self) -> ArtifactKind {
        match self {
            Stage::Extraction => ArtifactKind::Capture,
            Stage::Segmentation => ArtifactKind::Frames,
            Stage::Reconstruction => ArtifactKind::Masks,
            Stage::Tracking => ArtifactKind::Reconstruction,
        }
    }

    /// Artifact kind this stage produces.
    pub fn output_kind(self) -> ArtifactKind {
        match self {
            Stage::Extraction => ArtifactKind::Frames,
            Stage::Segmentation => ArtifactKind::Masks,
            Stage::Reconstruction => ArtifactKind::Reconstruction,
            Stage::Tracking => ArtifactKind::Tracks,
        }
    }

    /// The stage whose output this stage consumes.
    pub fn prerequisite(self) -> Option<Stage> {
        self.position()
            .checked_sub(1)
            .map(|index| CANONICAL_ORDER[index])
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Stage {
    type Err = StageSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CANONICAL_ORDER
            .iter()
            .copied()
            .find(|stage| stage.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| StageSetError::UnknownStage(s.to_string()))
    }
}

/// Reasons a stage selection is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageSetError {
    #[error("stages_to_run must not be empty")]
    Empty,

    #[error("stage '{0}' selected more than once")]
    Duplicate(Stage),

    #[error("stage '{missing}' is required between '{before}' and '{after}'")]
    Gap {
        before: Stage,
        missing: Stage,
        after: Stage,
    },

    #[error("unknown stage '{0}'")]
    UnknownStage(String),
}

/// Ordered, contiguous subset of [`CANONICAL_ORDER`].
///
/// Input order does not matter; stages are normalized into canonical order.
/// Stages before the first selected one are assumed satisfied by the source
/// artifact, so a gap inside the selection is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Stage>", into = "Vec<Stage>")]
pub struct StageSet {
    stages: Vec<Stage>,
}

impl StageSet {
    /// Validates and normalizes a stage selection.
    pub fn new(stages: impl IntoIterator<Item = Stage>) -> Result<Self, StageSetError> {
        let mut stages: Vec<Stage> = stages.into_iter().collect();
        if stages.is_empty() {
            return Err(StageSetError::Empty);
        }

        stages.sort_by_key(|stage| stage.position());
        for pair in stages.windows(2) {
            if pair[0] == pair[1] {
                return Err(StageSetError::Duplicate(pair[0]));
            }
            if pair[1].position() != pair[0].position() + 1 {
                return Err(StageSetError::Gap {
                    before: pair[0],
                    missing: CANONICAL_ORDER[pair[0].position() + 1],
                    after: pair[1],
                });
            }
        }

        Ok(Self { stages })
    }

    /// Every stage, in canonical order.
    pub fn all() -> Self {
        Self {
            stages: CANONICAL_ORDER.to_vec(),
        }
    }

    /// First stage to execute.
    pub fn first(&self) -> Stage {
        self.stages[0]
    }

    /// Last stage to execute.
    pub fn last(&self) -> Stage {
        self.stages[self.stages.len() - 1]
    }

    /// Next selected stage after `stage`, if any.
    pub fn next_after(&self, stage: Stage) -> Option<Stage> {
        self.stages
            .iter()
            .copied()
            .find(|candidate| candidate.position() > stage.position())
    }

    /// Selected stages strictly after `stage`.
    pub fn remaining_after(&self, stage: Stage) -> Vec<Stage> {
        self.stages
            .iter()
            .copied()
            .filter(|candidate| candidate.position() > stage.position())
            .collect()
    }

    /// The suffix of this selection starting at `stage`.
    pub fn suffix_from(&self, stage: Stage) -> Option<Self> {
        if !self.contains(stage) {
            return None;
        }
        let stages = self
            .stages
            .iter()
            .copied()
            .filter(|candidate| candidate.position() >= stage.position())
            .collect();
        Some(Self { stages })
    }

    /// Whether `stage` is part of the selection.
    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    /// Selected stages in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.iter().copied()
    }

    /// Selected stages as a slice, in canonical order.
    pub fn as_slice(&self) -> &[Stage] {
        &self.stages
    }

    /// Number of selected stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a validated selection.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl TryFrom<Vec<Stage>> for StageSet {
    type Error = StageSetError;

    fn try_from(stages: Vec<Stage>) -> Result<Self, Self::Error> {
        Self::new(stages)
    }
}

impl From<StageSet> for Vec<Stage> {
    fn from(set: StageSet) -> Self {
        set.stages
    }
}

/// Per-stage parameters passed through to the stage implementation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl StageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a single parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Parameter value by name.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }
}

/// Measurements a stage reports on success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Units of work processed (frames, usually).
    pub units_processed: u64,
    /// Wall-clock time the stage took.
    pub elapsed: Duration,
    /// Aggregate bytes of all files the stage wrote.
    pub bytes_written: u64,
}

/// Successful result of a stage: a fully committed artifact plus metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub artifact: Artifact,
    pub metrics: StageMetrics,
}

impl StageOutput {
    pub fn new(artifact: Artifact, metrics: StageMetrics) -> Self {
        Self { artifact, metrics }
    }
}

/// Receives progress reports from running stages.
pub trait ProgressSink: Send + Sync {
    /// Total units the current stage expects to process.
    fn set_total_units(&self, job_id: JobId, stage: Stage, total: u64);

    /// Cumulative units completed so far in the current stage.
    fn units_completed(&self, job_id: JobId, stage: Stage, done: u64);
}

/// Sink that drops every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn set_total_units(&self, _job_id: JobId, _stage: Stage, _total: u64) {}

    fn units_completed(&self, _job_id: JobId, _stage: Stage, _done: u64) {}
}

/// Handle given to a stage for one invocation.
///
/// Stages should call [`StageContext::checkpoint`] at every unit-of-work
/// boundary so cancellation latency stays bounded by one unit.
#[derive(Clone)]
pub struct StageContext {
    job_id: JobId,
    stage: Stage,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
}

impl StageContext {
    pub fn new(
        job_id: JobId,
        stage: Stage,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            job_id,
            stage,
            cancel,
            progress,
        }
    }

    /// Context not attached to any job, for driving a stage directly.
    pub fn detached(stage: Stage) -> Self {
        Self::new(
            JobId::new(),
            stage,
            CancellationToken::new(),
            Arc::new(NoopProgress),
        )
    }

    /// Job the stage runs for.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Stage being run.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Whether the job was asked to cancel.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `Err(StageError::Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Token for use in `tokio::select!` around awaits inside a stage.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Announces how many units the stage will process, for ETA.
    pub fn set_total_units(&self, total: u64) {
        self.progress.set_total_units(self.job_id, self.stage, total);
    }

    /// Reports the cumulative number of units completed.
    pub fn report_progress(&self, units_done: u64) {
        self.progress
            .units_completed(self.job_id, self.stage, units_done);
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("job_id", &self.job_id)
            .field("stage", &self.stage)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Contract every pipeline stage implements.
///
/// A stage either returns a fully committed artifact or an error; it never
/// leaves partial output behind for the caller to meter.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(
        &self,
        input: &Artifact,
        config: &StageConfig,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError>;
}

/// Stage implementations keyed by stage.
#[derive(Clone, Default)]
pub struct StageRegistry {
    runners: HashMap<Stage, Arc<dyn StageRunner>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the implementation for a stage.
    pub fn register(mut self, stage: Stage, runner: Arc<dyn StageRunner>) -> Self {
        self.runners.insert(stage, runner);
        self
    }

    /// Runner registered for `stage`.
    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageRunner>> {
        self.runners.get(&stage).cloned()
    }

    /// Selected stages without a registered implementation.
    pub fn missing(&self, stages: &StageSet) -> Vec<Stage> {
        stages
            .iter()
            .filter(|stage| !self.runners.contains_key(stage))
            .collect()
    }

    /// Wraps every registered runner with the given retry policy.
    pub fn with_retry(self, policy: RetryPolicy) -> Self {
        let runners = self
            .runners
            .into_iter()
            .map(|(stage, runner)| {
                let wrapped: Arc<dyn StageRunner> =
                    Arc::new(RetryingStage::new(runner, policy.clone()));
                (stage, wrapped)
            })
            .collect();
        Self { runners }
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<Stage> = self.runners.keys().copied().collect();
        stages.sort();
        f.debug_struct("StageRegistry")
            .field("stages", &stages)
            .finish()
    }
}
