//! Job orchestrator.
//!
//! The `Orchestrator` coordinates:
//! - Job creation and stage-selection validation
//! - Sequential stage execution on one worker per job, bounded by a semaphore
//! - Failure classification and cooperative cancellation
//! - Storage metering on committed outputs
//! - Dataset curation after the last production stage
//!
//! Job records live in a shared [`JobStore`]; status queries read consistent
//! snapshots while workers update them.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::diversity::{
    CandidateItem, CandidateSource, CurationError, Dataset, DiversitySelector, Selection,
    SelectionBudget,
};
use crate::error::{classify, ErrorKind, ErrorRecord, OrchestratorError, OrchestratorResult, StageVerdict};
use crate::metrics::MetricsCollector;
use crate::progress::{project_eta, EtaEstimate, StageDurationHistory};
use crate::scheduler::{
    Advance, JobId, JobSpec, JobStatus, JobStatusReport, JobStore, ProcessingJob,
};
use crate::stage::{ProgressSink, Stage, StageContext, StageRegistry, StageSet};

use super::config::OrchestratorConfig;

/// Main orchestrator that drives jobs through their stages.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: StageRegistry,
    store: Arc<JobStore>,
    selector: DiversitySelector,
    candidate_source: Option<Arc<dyn CandidateSource>>,
    history: RwLock<StageDurationHistory>,
    concurrency_limiter: Arc<Semaphore>,
    metrics: MetricsCollector,
}

impl Orchestrator {
    /// Creates an orchestrator over the given stage implementations.
    ///
    /// Every runner is wrapped with the configured retry policy for model
    /// errors.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Configuration` if the configuration is invalid.
    pub fn new(config: OrchestratorConfig, registry: StageRegistry) -> OrchestratorResult<Self> {
        config
            .validate()
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))?;

        let registry = registry.with_retry(config.retry_policy());
        let selector = config.selector();
        let concurrency_limiter = Arc::new(Semaphore::new(config.max_concurrent_jobs));

        Ok(Self {
            config,
            registry,
            store: Arc::new(JobStore::new()),
            selector,
            candidate_source: None,
            history: RwLock::new(StageDurationHistory::new()),
            concurrency_limiter,
            metrics: MetricsCollector::new(),
        })
    }

    /// Sets the source that turns a job's final artifact into a candidate pool.
    pub fn with_candidate_source(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.candidate_source = Some(source);
        self
    }

    /// Shared job store, for record export and monitoring.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Validated configuration this orchestrator runs with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Snapshot of the per-stage duration history.
    pub fn stage_history(&self) -> StageDurationHistory {
        self.history
            .read()
            .expect("stage history read lock poisoned")
            .clone()
    }

    // -- job lifecycle ---------------------------------------------------

    /// Validates a job request and registers it as `pending`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error (and creates nothing) when the stage
    /// selection is empty, duplicated or has gaps, when the source artifact
    /// does not feed the first selected stage, when a selected stage has no
    /// implementation, or when curation is requested without a budget limit
    /// or a candidate source.
    pub fn create_job(&self, spec: JobSpec) -> OrchestratorResult<JobId> {
        let job = self.build_job(spec)?;
        let stages = job.stages_to_run().clone();
        let id = self.store.insert(job);

        info!(
            job_id = %id,
            stages = ?stages.as_slice(),
            "Job created"
        );
        Ok(id)
    }

    fn build_job(&self, spec: JobSpec) -> OrchestratorResult<ProcessingJob> {
        let stages = StageSet::new(spec.stages)?;

        let first = stages.first();
        if spec.source.kind != first.input_kind() {
            return Err(OrchestratorError::Configuration(format!(
                "stage {} consumes {} artifacts, but the source is {}",
                first,
                first.input_kind(),
                spec.source.kind
            )));
        }

        let missing = self.registry.missing(&stages);
        if !missing.is_empty() {
            return Err(OrchestratorError::Configuration(format!(
                "no implementation registered for stages {:?}",
                missing
            )));
        }

        if let Some(stage) = spec
            .stage_configs
            .keys()
            .find(|stage| !stages.contains(**stage))
        {
            return Err(OrchestratorError::Configuration(format!(
                "parameters given for stage {} which is not selected",
                stage
            )));
        }

        let curation = match spec.curation {
            Some(budget) => {
                let budget = SelectionBudget::new(budget.count, budget.bytes)?;
                if self.candidate_source.is_none() {
                    return Err(OrchestratorError::Configuration(
                        "curation requested but no candidate source is configured".to_string(),
                    ));
                }
                Some(budget)
            }
            None => None,
        };

        Ok(
            ProcessingJob::new(stages, spec.source, self.config.eta_window, Utc::now())
                .with_stage_configs(spec.stage_configs)
                .with_curation(curation),
        )
    }

    /// Consistent snapshot of a job's status, progress and ETA.
    pub fn get_job_status(&self, job_id: JobId) -> OrchestratorResult<JobStatusReport> {
        self.store.inspect(job_id, |job| {
            let eta = if job.status().is_terminal() {
                EtaEstimate::finished()
            } else {
                let history = self
                    .history
                    .read()
                    .expect("stage history read lock poisoned");
                project_eta(job.current_progress(), &job.pending_stages(), &history)
            };
            JobStatusReport::from_job(job, eta)
        })
    }

    /// Cancels a pending or running job.
    ///
    /// A pending job is cancelled immediately. A running job is signalled and
    /// this call waits until its worker reaches the next unit boundary and
    /// settles. Committed outputs and `storage_size_bytes` are kept.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::JobState` if the job already finished, or
    /// finished on its own before it observed the cancellation.
    pub async fn cancel_job(&self, job_id: JobId) -> OrchestratorResult<JobStatus> {
        let token = self.store.cancellation_token(job_id)?;
        let mut status_rx = self.store.subscribe(job_id)?;

        let cancelled_directly = self.store.update(job_id, |job| {
            if job.status() == JobStatus::Running {
                Ok(false)
            } else {
                job.cancel(Utc::now()).map(|_| true)
            }
        })?;
        token.cancel();

        if cancelled_directly {
            info!(job_id = %job_id, "Pending job cancelled");
            self.metrics.record_job_finished(JobStatus::Cancelled);
            return Ok(JobStatus::Cancelled);
        }

        debug!(job_id = %job_id, "Cancellation requested, waiting for worker");
        let status = *status_rx
            .wait_for(|status| status.is_terminal())
            .await
            .map_err(|e| OrchestratorError::Worker(e.to_string()))?;

        if status == JobStatus::Cancelled {
            Ok(status)
        } else {
            Err(OrchestratorError::JobState {
                job_id,
                status,
                operation: "cancel",
            })
        }
    }

    /// Runs a pending job to a terminal status on the current task.
    ///
    /// Waits for a concurrency permit first. Stage failures are not errors
    /// of this call: they end the job as `failed` and are visible in the
    /// returned report.
    pub async fn run_job(&self, job_id: JobId) -> OrchestratorResult<JobStatusReport> {
        let _permit = self.concurrency_limiter.acquire().await.map_err(|e| {
            OrchestratorError::Worker(format!("Failed to acquire permit: {}", e))
        })?;

        let token = self.store.cancellation_token(job_id)?;
        let first = self.store.update(job_id, |job| job.start(Utc::now()))?;
        info!(job_id = %job_id, stage = %first, "Job started");

        self.metrics.inc_jobs_in_progress();
        let guard = WorkerGuard {
            store: &self.store,
            metrics: &self.metrics,
            job_id,
            token: token.clone(),
        };

        if let Err(err) = self.drive(job_id, first, &token).await {
            self.abandon(job_id, &err);
        }
        drop(guard);

        let report = self.get_job_status(job_id)?;
        self.metrics.record_job_finished(report.status);
        Ok(report)
    }

    /// Ends a job whose worker hit an internal error, so it never stays `running`.
    fn abandon(&self, job_id: JobId, err: &OrchestratorError) {
        let outcome = self.store.update(job_id, |job| {
            if job.status().is_terminal() {
                return Ok(None);
            }
            let stage = job.current_stage();
            let kind = if stage.is_some() {
                ErrorKind::Processing
            } else {
                ErrorKind::Export
            };
            let record = ErrorRecord::new(kind, stage, err.to_string())
                .with_details(serde_json::json!({ "cause": "worker" }));
            job.fail(record, Utc::now()).map(|_| Some((stage, kind)))
        });

        match outcome {
            Ok(Some((stage, kind))) => {
                error!(job_id = %job_id, error = %err, "Worker failed, job marked failed");
                if let Some(stage) = stage {
                    self.metrics.record_stage_failure(stage, kind);
                }
            }
            Ok(None) => warn!(job_id = %job_id, error = %err, "Worker error after job finished"),
            Err(update_err) => {
                error!(job_id = %job_id, error = %err, update_error = %update_err, "Failed to record worker failure")
            }
        }
    }

    /// Runs a job on its own tokio task.
    pub fn spawn_job(self: &Arc<Self>, job_id: JobId) -> JoinHandle<OrchestratorResult<JobStatusReport>> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run_job(job_id).await })
    }

    /// Runs multiple jobs concurrently, bounded by `max_concurrent_jobs`.
    pub async fn run_jobs(&self, job_ids: Vec<JobId>) -> Vec<OrchestratorResult<JobStatusReport>> {
        if job_ids.is_empty() {
            return Vec::new();
        }

        let futures: Vec<_> = job_ids.into_iter().map(|id| self.run_job(id)).collect();
        futures::future::join_all(futures).await
    }

    /// Creates a new pending job that picks up a failed or cancelled job at `stage`.
    ///
    /// The new job runs `stage` and the rest of the original selection, fed
    /// by the artifact the original job committed for the preceding stage
    /// (or the original source when `stage` was its first stage).
    pub fn resume_from_stage(&self, job_id: JobId, stage: Stage) -> OrchestratorResult<JobId> {
        let original = self.store.get(job_id)?;
        if !matches!(original.status(), JobStatus::Failed | JobStatus::Cancelled) {
            return Err(OrchestratorError::JobState {
                job_id,
                status: original.status(),
                operation: "resume",
            });
        }

        let stages = original.stages_to_run().suffix_from(stage).ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "stage {} was not selected for job {}",
                stage, job_id
            ))
        })?;

        let source = stage
            .prerequisite()
            .and_then(|previous| original.artifact_for(previous))
            .unwrap_or(original.source())
            .clone();

        let stage_configs: BTreeMap<_, _> = original
            .stage_configs()
            .iter()
            .filter(|(configured, _)| stages.contains(**configured))
            .map(|(configured, config)| (*configured, config.clone()))
            .collect();

        let mut spec = JobSpec::new(stages.iter(), source);
        spec.stage_configs = stage_configs;
        spec.curation = original.curation().copied();

        let job = self.build_job(spec)?.resumed_from_job(job_id);
        let id = self.store.insert(job);

        info!(
            job_id = %id,
            resumed_from = %job_id,
            stage = %stage,
            "Job resumed"
        );
        Ok(id)
    }

    /// Curates a dataset from an explicit pool, outside any production job.
    pub async fn curate_dataset(
        &self,
        pool: Vec<CandidateItem>,
        count_budget: Option<usize>,
        byte_budget: Option<u64>,
    ) -> OrchestratorResult<Dataset> {
        let budget = SelectionBudget::new(count_budget, byte_budget)?;
        let pool_size = pool.len();
        let selection = self.select(pool, budget, None).await??;

        let dataset = Dataset::from_selection(None, &selection);
        self.store.insert_dataset(dataset.clone());

        info!(
            dataset_id = %dataset.id,
            pool = pool_size,
            samples = dataset.sample_count,
            bytes = dataset.output_size_bytes,
            "Dataset curated"
        );
        Ok(dataset)
    }

    // -- worker ----------------------------------------------------------

    /// Executes stages from `first` until the job reaches a terminal status.
    async fn drive(
        &self,
        job_id: JobId,
        first: Stage,
        token: &CancellationToken,
    ) -> OrchestratorResult<()> {
        let progress: Arc<dyn ProgressSink> = self.store.clone();
        let mut stage = first;

        loop {
            let (input, config) = self.store.inspect(job_id, |job| {
                (job.latest_artifact().clone(), job.stage_config(stage))
            })?;

            let Some(runner) = self.registry.get(stage) else {
                let record = ErrorRecord::new(
                    ErrorKind::Configuration,
                    Some(stage),
                    format!("no implementation registered for stage {}", stage),
                );
                return self.fail_job(job_id, stage, record);
            };

            debug!(job_id = %job_id, stage = %stage, input = %input.location.display(), "Running stage");
            let ctx = StageContext::new(job_id, stage, token.clone(), progress.clone());
            let started = Instant::now();
            let result = runner.run(&input, &config, &ctx).await;

            // Output produced after cancellation is discarded unmetered.
            if token.is_cancelled() {
                return self.cancel_running(job_id, stage);
            }

            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    return match classify(stage, &err) {
                        StageVerdict::Cancelled => self.cancel_running(job_id, stage),
                        StageVerdict::Fatal(record) => self.fail_job(job_id, stage, record),
                    };
                }
            };

            let elapsed = started.elapsed();
            let bytes = output.metrics.bytes_written;
            let advance = self.store.update(job_id, |job| {
                job.advance(stage, output.artifact, bytes, Utc::now())
            })?;

            self.history
                .write()
                .expect("stage history write lock poisoned")
                .record(stage, elapsed);
            self.metrics.record_stage_completed(stage, elapsed, bytes);
            info!(
                job_id = %job_id,
                stage = %stage,
                bytes = bytes,
                units = output.metrics.units_processed,
                elapsed_secs = elapsed.as_secs_f64(),
                "Stage completed"
            );

            match advance {
                Advance::Next(next) => stage = next,
                Advance::Curate => return self.curate_job(job_id, token).await,
                Advance::Completed => {
                    info!(job_id = %job_id, "Job completed");
                    return Ok(());
                }
            }
        }
    }

    fn fail_job(&self, job_id: JobId, stage: Stage, record: ErrorRecord) -> OrchestratorResult<()> {
        error!(
            job_id = %job_id,
            stage = %stage,
            kind = %record.kind,
            error = %record.message,
            "Stage failed"
        );
        self.metrics.record_stage_failure(stage, record.kind);
        self.store.update(job_id, |job| job.fail(record, Utc::now()))
    }

    fn cancel_running(&self, job_id: JobId, stage: Stage) -> OrchestratorResult<()> {
        warn!(job_id = %job_id, stage = %stage, "Job cancelled");
        self.store.update(job_id, |job| job.cancel(Utc::now()))
    }

    /// Builds the curated dataset for a job whose production stages are done.
    async fn curate_job(
        &self,
        job_id: JobId,
        token: &CancellationToken,
    ) -> OrchestratorResult<()> {
        let (artifact, budget) = self.store.inspect(job_id, |job| {
            (job.latest_artifact().clone(), job.curation().copied())
        })?;

        let selection = match (&self.candidate_source, budget) {
            (Some(source), Some(budget)) => match source.candidates(job_id, &artifact).await {
                Ok(pool) => self.select(pool, budget, Some(token.clone())).await?,
                Err(err) => Err(err),
            },
            _ => Err(CurationError::Source(
                "no candidate source or budget for curation".to_string(),
            )),
        };

        if token.is_cancelled() {
            warn!(job_id = %job_id, "Job cancelled during curation");
            return self.store.update(job_id, |job| job.cancel(Utc::now()));
        }

        match selection {
            Ok(selection) => {
                let dataset = Dataset::from_selection(Some(job_id), &selection);
                let samples = dataset.sample_count;
                let bytes = dataset.output_size_bytes;
                let dataset_id = self.store.insert_dataset(dataset);
                self.store
                    .update(job_id, |job| job.complete_curation(dataset_id, Utc::now()))?;
                info!(
                    job_id = %job_id,
                    dataset_id = %dataset_id,
                    samples = samples,
                    bytes = bytes,
                    "Job completed with curated dataset"
                );
                Ok(())
            }
            Err(err) => {
                let record = ErrorRecord::export(err.to_string())
                    .with_details(serde_json::json!({ "cause": err.kind().label() }));
                error!(job_id = %job_id, error = %err, "Curation failed");
                self.store.update(job_id, |job| job.fail(record, Utc::now()))
            }
        }
    }

    /// Runs the CPU-bound selection off the async worker threads. With a
    /// token, selection stops at the next round after cancellation.
    async fn select(
        &self,
        pool: Vec<CandidateItem>,
        budget: SelectionBudget,
        token: Option<CancellationToken>,
    ) -> OrchestratorResult<Result<Selection, CurationError>> {
        let selector = self.selector;
        let started = Instant::now();
        let selection = tokio::task::spawn_blocking(move || {
            selector.select_until(&pool, budget, || {
                token.as_ref().is_some_and(CancellationToken::is_cancelled)
            })
        })
        .await?;

        if let Ok(selection) = &selection {
            self.metrics
                .record_curation(selection.selected.len(), started.elapsed());
        }
        Ok(selection)
    }
}

/// Settles a job whose `run_job` future is dropped before the job finishes,
/// e.g. an aborted `spawn_job` handle or a timeout around `run_job`.
struct WorkerGuard<'a> {
    store: &'a JobStore,
    metrics: &'a MetricsCollector,
    job_id: JobId,
    token: CancellationToken,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.dec_jobs_in_progress();

        let abandoned = self.store.update(self.job_id, |job| {
            if job.status().is_terminal() {
                Ok(false)
            } else {
                job.cancel(Utc::now()).map(|_| true)
            }
        });
        if matches!(abandoned, Ok(true)) {
            // Stops any stage or selection still running on a detached thread.
            self.token.cancel();
            warn!(job_id = %self.job_id, "Worker dropped before the job finished, job cancelled");
            self.metrics.record_job_finished(JobStatus::Cancelled);
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("jobs", &self.store.len())
            .finish()
    }
}
