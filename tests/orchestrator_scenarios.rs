//! End-to-end job scenarios driven through the public orchestrator API.

mod common;

use std::time::Duration;

use capforge::artifact::{Artifact, ArtifactKind};
use capforge::stage::StageRegistry;
use capforge::{ErrorKind, JobSpec, JobStatus, Orchestrator, OrchestratorError, Stage};
use common::*;

#[tokio::test]
async fn test_model_failure_after_extraction_keeps_committed_storage() {
    let segmentation = FlakyModel::new(u32::MAX, MB);
    let registry = StageRegistry::new()
        .register(Stage::Extraction, Producer::instant(100 * MB))
        .register(Stage::Segmentation, segmentation.clone());
    let orch = orchestrator(registry);

    let id = orch
        .create_job(JobSpec::new([Stage::Extraction, Stage::Segmentation], capture()))
        .expect("create");
    let report = orch.run_job(id).await.expect("run");

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.storage_size_bytes, 100 * MB);
    assert_eq!(report.current_stage, None);
    assert_eq!(report.last_completed_stage, Some(Stage::Extraction));

    let error = report.error.expect("error record");
    assert_eq!(error.kind, ErrorKind::Model);
    assert_eq!(error.stage, Some(Stage::Segmentation));
    assert_eq!(error.details["attempts"], 3);
    assert_eq!(segmentation.calls(), 3);
}

#[tokio::test]
async fn test_transient_model_error_is_retried_inside_stage() {
    let segmentation = FlakyModel::new(2, 5 * MB);
    let registry = StageRegistry::new()
        .register(Stage::Extraction, Producer::instant(10 * MB))
        .register(Stage::Segmentation, segmentation.clone());
    let orch = orchestrator(registry);

    let id = orch
        .create_job(JobSpec::new([Stage::Extraction, Stage::Segmentation], capture()))
        .expect("create");
    let report = orch.run_job(id).await.expect("run");

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.storage_size_bytes, 15 * MB);
    assert_eq!(segmentation.calls(), 3);
}

#[tokio::test]
async fn test_reconstruction_processing_error_is_fatal() {
    let registry = StageRegistry::new()
        .register(Stage::Segmentation, Producer::instant(MB))
        .register(Stage::Reconstruction, std::sync::Arc::new(Broken));
    let orch = orchestrator(registry);

    let frames = Artifact::new(ArtifactKind::Frames, "/frames/session-01");
    let id = orch
        .create_job(JobSpec::new(
            [Stage::Segmentation, Stage::Reconstruction],
            frames,
        ))
        .expect("create");
    let report = orch.run_job(id).await.expect("run");

    assert_eq!(report.status, JobStatus::Failed);
    let error = report.error.expect("error record");
    assert_eq!(error.kind, ErrorKind::Reconstruction);
    assert_eq!(error.stage, Some(Stage::Reconstruction));
    assert_eq!(report.storage_size_bytes, MB);
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let orch = orchestrator(instant_registry(MB));
    let id = orch
        .create_job(JobSpec::new([Stage::Extraction], capture()))
        .expect("create");

    let status = orch.cancel_job(id).await.expect("cancel");
    assert_eq!(status, JobStatus::Cancelled);

    let report = orch.get_job_status(id).expect("status");
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.current_stage, None);
    assert_eq!(report.storage_size_bytes, 0);

    let err = orch.run_job(id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::JobState { .. }));
    assert_eq!(orch.get_job_status(id).expect("status").status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_running_job_keeps_committed_storage() {
    let registry = StageRegistry::new()
        .register(Stage::Extraction, Producer::instant(100 * MB))
        .register(
            Stage::Segmentation,
            Producer::slow(10_000, Duration::from_millis(2), 40 * MB),
        );
    let orch = orchestrator(registry);
    let id = orch
        .create_job(JobSpec::new([Stage::Extraction, Stage::Segmentation], capture()))
        .expect("create");

    let handle = orch.spawn_job(id);
    let running = wait_for_status(&orch, id, Duration::from_secs(5), in_stage(Stage::Segmentation)).await;
    assert_eq!(running.storage_size_bytes, 100 * MB);

    let status = orch.cancel_job(id).await.expect("cancel");
    assert_eq!(status, JobStatus::Cancelled);

    let report = handle.await.expect("join").expect("run");
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.storage_size_bytes, 100 * MB);
    assert_eq!(report.last_completed_stage, Some(Stage::Extraction));
    assert_eq!(report.current_stage, None);
    assert!(report.error.is_none());

    let job = orch.store().get(id).expect("job");
    assert!(job.storage().is_committed(Stage::Extraction));
    assert!(!job.storage().is_committed(Stage::Segmentation));
}

#[tokio::test]
async fn test_cancel_unknown_job_is_not_found() {
    let orch = orchestrator(instant_registry(MB));
    let err = orch.cancel_job(capforge::JobId::new()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_current_stage_stays_within_selection() {
    let registry = StageRegistry::new()
        .register(
            Stage::Segmentation,
            Producer::slow(20, Duration::from_millis(2), MB),
        )
        .register(
            Stage::Reconstruction,
            Producer::slow(20, Duration::from_millis(2), 2 * MB),
        );
    let orch = orchestrator(registry);
    let frames = Artifact::new(ArtifactKind::Frames, "/frames/session-02");
    let id = orch
        .create_job(JobSpec::new(
            [Stage::Reconstruction, Stage::Segmentation],
            frames,
        ))
        .expect("create");

    let handle = orch.spawn_job(id);
    let mut seen = Vec::new();
    loop {
        let report = orch.get_job_status(id).expect("status");
        if let Some(stage) = report.current_stage {
            assert!(
                matches!(stage, Stage::Segmentation | Stage::Reconstruction),
                "unexpected stage {}",
                stage
            );
            assert!(report.stage_started_at.is_some());
            if seen.last() != Some(&stage) {
                seen.push(stage);
            }
        }
        if report.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let report = handle.await.expect("join").expect("run");
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.storage_size_bytes, 3 * MB);
    // Stages never run out of canonical order.
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn test_status_reports_rate_and_eta_while_running() {
    let registry = StageRegistry::new()
        .register(Stage::Extraction, Producer::slow(200, Duration::from_millis(5), MB))
        .register(Stage::Segmentation, Producer::instant(MB));
    let orch = orchestrator(registry);
    let id = orch
        .create_job(JobSpec::new([Stage::Extraction, Stage::Segmentation], capture()))
        .expect("create");

    let handle = orch.spawn_job(id);
    let report = wait_for_status(&orch, id, Duration::from_secs(5), |report| {
        report.frames_per_second.is_some()
    })
    .await;

    assert_eq!(report.current_stage, Some(Stage::Extraction));
    assert!(report.frames_per_second.expect("rate") > 0.0);
    assert!(report.eta_estimate.current_stage_remaining.is_some());
    // Segmentation has never run, so its duration is unknown.
    assert_eq!(report.eta_estimate.unknown_stages, vec![Stage::Segmentation]);
    assert_eq!(report.eta_estimate.total, None);

    orch.cancel_job(id).await.expect("cancel");
    handle.await.expect("join").expect("run");
}

#[tokio::test]
async fn test_eta_uses_history_of_completed_stages() {
    let orch = orchestrator(instant_registry(MB));
    let first = orch
        .create_job(JobSpec::new([Stage::Extraction, Stage::Segmentation], capture()))
        .expect("create");
    orch.run_job(first).await.expect("run");

    let second = orch
        .create_job(JobSpec::new([Stage::Extraction, Stage::Segmentation], capture()))
        .expect("create");
    let report = orch.get_job_status(second).expect("status");
    assert!(report.eta_estimate.unknown_stages.is_empty());
    assert!(report.eta_estimate.total.is_some());
}

#[tokio::test]
async fn test_resume_failed_job_from_failed_stage() {
    let segmentation = FlakyModel::new(3, 7 * MB);
    let registry = StageRegistry::new()
        .register(Stage::Extraction, Producer::instant(100 * MB))
        .register(Stage::Segmentation, segmentation.clone())
        .register(Stage::Reconstruction, Producer::instant(MB));
    let orch = orchestrator(registry);

    let failed = orch
        .create_job(JobSpec::new(
            [Stage::Extraction, Stage::Segmentation, Stage::Reconstruction],
            capture(),
        ))
        .expect("create");
    let report = orch.run_job(failed).await.expect("run");
    assert_eq!(report.status, JobStatus::Failed);

    let resumed = orch
        .resume_from_stage(failed, Stage::Segmentation)
        .expect("resume");
    let job = orch.store().get(resumed).expect("job");
    assert_eq!(job.resumed_from(), Some(failed));
    assert_eq!(job.source().kind, ArtifactKind::Frames);
    assert_eq!(
        job.stages_to_run().as_slice(),
        &[Stage::Segmentation, Stage::Reconstruction]
    );

    let report = orch.run_job(resumed).await.expect("run");
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.storage_size_bytes, 8 * MB);

    // The original record is untouched.
    let original = orch.get_job_status(failed).expect("status");
    assert_eq!(original.status, JobStatus::Failed);
    assert_eq!(original.storage_size_bytes, 100 * MB);
}

#[tokio::test]
async fn test_resume_rejections() {
    let orch = orchestrator(instant_registry(MB));
    let done = orch
        .create_job(JobSpec::new([Stage::Extraction], capture()))
        .expect("create");
    orch.run_job(done).await.expect("run");
    let err = orch.resume_from_stage(done, Stage::Extraction).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobState);

    let cancelled = orch
        .create_job(JobSpec::new([Stage::Extraction, Stage::Segmentation], capture()))
        .expect("create");
    orch.cancel_job(cancelled).await.expect("cancel");
    let err = orch
        .resume_from_stage(cancelled, Stage::Tracking)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    // Nothing was committed for extraction, so segmentation has no input.
    let err = orch
        .resume_from_stage(cancelled, Stage::Segmentation)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let resumed = orch
        .resume_from_stage(cancelled, Stage::Extraction)
        .expect("resume from the start");
    assert_eq!(
        orch.run_job(resumed).await.expect("run").status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_concurrent_jobs_progress_independently() {
    let orch = std::sync::Arc::new(
        Orchestrator::new(
            fast_config().with_max_concurrent_jobs(2),
            instant_registry(MB),
        )
        .expect("orchestrator"),
    );

    let ids: Vec<_> = (0..6)
        .map(|_| {
            orch.create_job(JobSpec::new(capforge::stage::CANONICAL_ORDER, capture()))
                .expect("create")
        })
        .collect();

    let reports = orch.run_jobs(ids.clone()).await;
    assert_eq!(reports.len(), 6);
    for report in reports {
        let report = report.expect("run");
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.storage_size_bytes, 4 * MB);
    }

    let records = orch.store().records();
    assert_eq!(records.len(), 6);
    let json = serde_json::to_value(&records[0]).expect("serialize");
    assert_eq!(json["status"], "completed");
    assert_eq!(json["storage_size_bytes"], 4 * MB);
}

#[tokio::test]
async fn test_aborted_worker_leaves_job_cancelled() {
    let registry = StageRegistry::new().register(
        Stage::Extraction,
        Producer::slow(10_000, Duration::from_millis(2), MB),
    );
    let orch = orchestrator(registry);
    let id = orch
        .create_job(JobSpec::new([Stage::Extraction], capture()))
        .expect("create");

    let handle = orch.spawn_job(id);
    wait_for_status(&orch, id, Duration::from_secs(5), in_stage(Stage::Extraction)).await;
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    let report = orch.get_job_status(id).expect("status");
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.current_stage, None);
    assert_eq!(report.storage_size_bytes, 0);

    let err = tokio::time::timeout(Duration::from_secs(2), orch.cancel_job(id))
        .await
        .expect("cancel_job returns promptly")
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::JobState { .. }));
}

#[tokio::test]
async fn test_timed_out_run_leaves_job_cancelled() {
    let registry = StageRegistry::new()
        .register(Stage::Extraction, Producer::instant(5 * MB))
        .register(
            Stage::Segmentation,
            Producer::slow(10_000, Duration::from_millis(2), MB),
        );
    let orch = orchestrator(registry);
    let id = orch
        .create_job(JobSpec::new([Stage::Extraction, Stage::Segmentation], capture()))
        .expect("create");

    let outcome = tokio::time::timeout(Duration::from_millis(200), orch.run_job(id)).await;
    assert!(outcome.is_err());

    let report = orch.get_job_status(id).expect("status");
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.storage_size_bytes, 5 * MB);
    assert_eq!(report.last_completed_stage, Some(Stage::Extraction));
    assert!(orch.store().cancellation_token(id).expect("token").is_cancelled());
}
