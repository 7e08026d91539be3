//! Fake stage implementations and helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use capforge::artifact::{Artifact, ArtifactKind};
use capforge::diversity::{CandidateItem, CandidateSource, CurationError};
use capforge::error::StageError;
use capforge::stage::{StageConfig, StageContext, StageMetrics, StageOutput, StageRunner};
use capforge::{JobId, JobStatusReport, Orchestrator, OrchestratorConfig, Stage, StageRegistry};

pub const MB: u64 = 1024 * 1024;

/// Processes `units` frames, pausing `per_unit` between them, then commits
/// an output of `bytes`.
pub struct Producer {
    pub units: u64,
    pub per_unit: Duration,
    pub bytes: u64,
}

impl Producer {
    pub fn instant(bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            units: 1,
            per_unit: Duration::ZERO,
            bytes,
        })
    }

    pub fn slow(units: u64, per_unit: Duration, bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            units,
            per_unit,
            bytes,
        })
    }
}

#[async_trait]
impl StageRunner for Producer {
    async fn run(
        &self,
        input: &Artifact,
        _config: &StageConfig,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let stage = ctx.stage();
        if input.kind != stage.input_kind() {
            return Err(StageError::MalformedInput(format!(
                "expected {} input, got {}",
                stage.input_kind(),
                input.kind
            )));
        }

        let started = Instant::now();
        ctx.set_total_units(self.units);
        for done in 1..=self.units {
            ctx.checkpoint()?;
            if !self.per_unit.is_zero() {
                tokio::time::sleep(self.per_unit).await;
            }
            ctx.report_progress(done);
        }

        let artifact = Artifact::new(stage.output_kind(), format!("/out/{}/{}", ctx.job_id(), stage))
            .with_size(self.bytes)
            .with_units(self.units);
        Ok(StageOutput::new(
            artifact,
            StageMetrics {
                units_processed: self.units,
                elapsed: started.elapsed(),
                bytes_written: self.bytes,
            },
        ))
    }
}

/// Fails with an inference error for the first `failures` calls, then
/// behaves like an instant [`Producer`].
pub struct FlakyModel {
    pub failures: u32,
    pub bytes: u64,
    pub calls: AtomicU32,
}

impl FlakyModel {
    pub fn new(failures: u32, bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            failures,
            bytes,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageRunner for FlakyModel {
    async fn run(
        &self,
        input: &Artifact,
        config: &StageConfig,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(StageError::Inference(format!("CUDA out of memory (call {})", call)));
        }
        let producer = Producer {
            units: 1,
            per_unit: Duration::ZERO,
            bytes: self.bytes,
        };
        producer.run(input, config, ctx).await
    }
}

/// Always fails with a processing error.
pub struct Broken;

#[async_trait]
impl StageRunner for Broken {
    async fn run(
        &self,
        _input: &Artifact,
        _config: &StageConfig,
        _ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        Err(StageError::Processing("degenerate disparity map".to_string()))
    }
}

/// Candidate source returning a fixed pool, or an error when `pool` is `None`.
pub struct FixedPool {
    pub pool: Option<Vec<CandidateItem>>,
}

#[async_trait]
impl CandidateSource for FixedPool {
    async fn candidates(
        &self,
        _job_id: JobId,
        _artifact: &Artifact,
    ) -> Result<Vec<CandidateItem>, CurationError> {
        self.pool
            .clone()
            .ok_or_else(|| CurationError::Source("track export unreadable".to_string()))
    }
}

/// Registry with an instant producer for every stage.
pub fn instant_registry(bytes: u64) -> StageRegistry {
    capforge::stage::CANONICAL_ORDER
        .iter()
        .fold(StageRegistry::new(), |registry, stage| {
            registry.register(*stage, Producer::instant(bytes))
        })
}

/// Config with no retry backoff, so failure paths run instantly.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_retry_backoff(Duration::ZERO)
        .with_model_retry_attempts(3)
}

pub fn orchestrator(registry: StageRegistry) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(fast_config(), registry).expect("valid orchestrator"))
}

pub fn capture() -> Artifact {
    Artifact::new(ArtifactKind::Capture, "/captures/session-01.svo")
}

/// Deterministic pool of `size` candidates spread over a grid.
pub fn grid_pool(size: u64, bytes_each: u64) -> Vec<CandidateItem> {
    (0..size)
        .map(|id| {
            let x = (id % 37) as f64;
            let y = (id / 37) as f64;
            let quality = ((id * 7919) % 101) as f64 / 100.0;
            CandidateItem::new(id, vec![x, y, (x * y).sqrt()], quality, bytes_each)
        })
        .collect()
}

/// Polls a job's status until `predicate` holds or `timeout` elapses.
pub async fn wait_for_status(
    orchestrator: &Orchestrator,
    job_id: JobId,
    timeout: Duration,
    predicate: impl Fn(&JobStatusReport) -> bool,
) -> JobStatusReport {
    let deadline = Instant::now() + timeout;
    loop {
        let report = orchestrator.get_job_status(job_id).expect("job exists");
        if predicate(&report) {
            return report;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for job {}, last status {:?}",
            job_id,
            report
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn in_stage(stage: Stage) -> impl Fn(&JobStatusReport) -> bool {
    move |report| report.current_stage == Some(stage)
}
