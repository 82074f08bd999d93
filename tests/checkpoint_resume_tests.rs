//! Checkpoint snapshot and resume behavior driven through the orchestrator

use std::collections::HashMap;

use chrono::Utc;

use bentham::domain::manifest::{
    CompletionCriteria, EvidenceLevel, ExecutionConfig, LocationConfig, ManifestRegistries,
    ManifestValidation, ProxyType, QualityGates, QuerySpec, SessionIsolation, StudyManifest,
    SurfaceConfig, ValidatedManifest, validate_manifest,
};
use bentham::domain::study::StudyStatus;
use bentham::infrastructure::checkpoint::{CheckpointStore, can_resume, remaining_cells};
use bentham::study_engine::hooks::OrchestratorHooks;
use bentham::study_engine::orchestrator::{OrchestratorConfig, StudyOrchestrator};
use bentham::utils::system_clock;

fn ten_cell_manifest() -> ValidatedManifest {
    let mut execution = ExecutionConfig::default();
    execution.query_delay_ms = (0, 0);

    let manifest = StudyManifest {
        name: "resume-study".to_string(),
        tenant_id: "tenant-1".to_string(),
        queries: (0..10)
            .map(|i| QuerySpec {
                text: format!("query number {i}"),
                category: None,
                tags: vec![],
            })
            .collect(),
        surfaces: vec![SurfaceConfig {
            id: "openai-api".to_string(),
            required: true,
            options: HashMap::new(),
        }],
        locations: vec![LocationConfig {
            id: "us".to_string(),
            proxy_type: ProxyType::Datacenter,
            require_sticky: false,
            proxy_provider: "auto".to_string(),
            session_duration_minutes: None,
        }],
        completion_criteria: CompletionCriteria {
            required_surface_ids: vec!["openai-api".to_string()],
            coverage_threshold: 1.0,
            optional_surface_ids: vec![],
            min_success_rate: 0.0,
            consecutive_failure_limit: 0,
            max_retries_per_cell: None,
        },
        quality_gates: QualityGates::default(),
        execution,
        evidence_level: EvidenceLevel::Metadata,
        legal_hold: false,
        deadline: None,
        session_isolation: SessionIsolation::Shared,
        retention_days: 90,
        max_cost_usd: None,
    };

    match validate_manifest(manifest, &ManifestRegistries::default(), Utc::now()) {
        ManifestValidation::Valid { manifest, .. } => *manifest,
        ManifestValidation::Invalid { errors, .. } => panic!("manifest invalid: {errors:?}"),
    }
}

fn orchestrator() -> StudyOrchestrator {
    StudyOrchestrator::new(
        OrchestratorConfig::default(),
        OrchestratorHooks::default(),
        system_clock(),
    )
}

async fn complete_n(orchestrator: &StudyOrchestrator, study_id: &str, n: usize) -> Vec<String> {
    let mut completed = Vec::new();
    for _ in 0..n {
        let job = orchestrator
            .get_next_jobs(study_id, 1)
            .await
            .into_iter()
            .next()
            .expect("a ready job");
        orchestrator.start_job(study_id, &job.id).await.unwrap();
        orchestrator
            .complete_job(study_id, &job.id, None)
            .await
            .unwrap();
        completed.push(job.id);
    }
    completed
}

#[tokio::test]
async fn snapshot_restore_rewinds_to_the_snapshot() {
    let orchestrator = orchestrator();
    let study = orchestrator.create_study(ten_cell_manifest()).await;
    orchestrator.start_study(&study.id).await.unwrap();

    complete_n(&orchestrator, &study.id, 3).await;
    let checkpoint = orchestrator.create_checkpoint(&study.id).await.unwrap();
    assert_eq!(checkpoint.completed_cells, 3);
    assert_eq!(checkpoint.total_cells, 10);

    // Drift past the snapshot.
    complete_n(&orchestrator, &study.id, 2).await;
    let drifted = orchestrator.get_study(&study.id).await.unwrap();
    assert_eq!(drifted.progress.completed_cells, 5);

    // Restore: progress and the completed set match the snapshot exactly.
    orchestrator
        .restore_from_checkpoint(&study.id, &checkpoint)
        .await
        .unwrap();
    let restored = orchestrator.get_study(&study.id).await.unwrap();
    assert_eq!(restored.progress.completed_cells, 3);
    assert_eq!(restored.progress.pending_cells(), 7);

    let remaining = remaining_cells(&checkpoint);
    assert_eq!(remaining.len(), 7);

    // The next dispatch batch is exactly the remaining cells, original order.
    let next = orchestrator.get_next_jobs(&study.id, 10).await;
    assert_eq!(next.len(), 7);
    let next_cells: Vec<String> = next.iter().map(|j| j.cell_key().to_string()).collect();
    let expected: Vec<String> = remaining.iter().map(|c| c.to_string()).collect();
    assert_eq!(next_cells, expected);
}

#[tokio::test]
async fn checkpoint_survives_disk_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());

    let orchestrator = orchestrator();
    let study = orchestrator.create_study(ten_cell_manifest()).await;
    orchestrator.start_study(&study.id).await.unwrap();
    complete_n(&orchestrator, &study.id, 4).await;

    let checkpoint = orchestrator.create_checkpoint(&study.id).await.unwrap();
    store.save(&checkpoint).await.unwrap();

    let loaded = store.load(&study.id).await.unwrap().unwrap();
    assert_eq!(loaded.study_id, checkpoint.study_id);
    assert_eq!(loaded.sequence_number, checkpoint.sequence_number);
    assert_eq!(loaded.completed_cells, 4);
    assert_eq!(loaded.progress_percent, 40);
    assert_eq!(loaded.execution_queue, checkpoint.execution_queue);
    assert_eq!(loaded.cell_results.len(), 4);

    let check = can_resume(&loaded);
    assert!(check.can_resume);
    assert_eq!(check.remaining_cells, 6);
}

#[tokio::test]
async fn restore_preserves_attempts_for_pending_cells() {
    let orchestrator = orchestrator();
    let study = orchestrator.create_study(ten_cell_manifest()).await;
    orchestrator.start_study(&study.id).await.unwrap();

    // Drive one cell through a retryable failure so it has attempts > 0.
    let job = orchestrator
        .get_next_jobs(&study.id, 1)
        .await
        .into_iter()
        .next()
        .unwrap();
    orchestrator.start_job(&study.id, &job.id).await.unwrap();
    let outcome = orchestrator
        .fail_job(
            &study.id,
            &job.id,
            "connection reset",
            bentham::ErrorCode::NetworkError,
        )
        .await
        .unwrap();
    assert!(outcome.will_retry);

    let checkpoint = orchestrator.create_checkpoint(&study.id).await.unwrap();
    assert_eq!(
        checkpoint
            .retry_states
            .get(&job.cell_key())
            .map(|r| r.attempts),
        Some(1)
    );

    orchestrator
        .restore_from_checkpoint(&study.id, &checkpoint)
        .await
        .unwrap();
    let restored = orchestrator.get_job(&study.id, &job.id).await.unwrap();
    assert_eq!(restored.attempts, 1);
    assert_eq!(restored.status, bentham::JobStatus::Pending);
}

#[tokio::test]
async fn fully_settled_checkpoint_is_not_resumable_and_restore_converges() {
    use bentham::infrastructure::checkpoint::{CellResult, apply_result};

    let orchestrator = orchestrator();
    let study = orchestrator.create_study(ten_cell_manifest()).await;
    orchestrator.start_study(&study.id).await.unwrap();

    // Build a snapshot in which every cell is terminal: 3 completed, 7 failed.
    let mut checkpoint = orchestrator.create_checkpoint(&study.id).await.unwrap();
    let cells = checkpoint.execution_queue.clone();
    for (i, cell_key) in cells.into_iter().enumerate() {
        checkpoint = apply_result(
            checkpoint,
            CellResult {
                cell_key,
                success: i < 3,
                completed_at: Utc::now(),
                duration_ms: Some(10),
                response_length: if i < 3 { Some(42) } else { None },
                error_code: (i >= 3).then_some(bentham::ErrorCode::AuthFailed),
                error_message: (i >= 3).then(|| "login rejected".to_string()),
            },
        );
    }
    assert_eq!(checkpoint.completed_cells, 3);
    assert_eq!(checkpoint.failed_cells, 7);

    // Nothing is left to dispatch, so the snapshot must not claim resumability.
    let check = can_resume(&checkpoint);
    assert!(!check.can_resume);
    assert_eq!(check.remaining_cells, 0);

    // Restoring it anyway must drive the executing study to a terminal
    // status instead of leaving it waiting on jobs that never become ready.
    orchestrator
        .restore_from_checkpoint(&study.id, &checkpoint)
        .await
        .unwrap();
    let restored = orchestrator.get_study(&study.id).await.unwrap();
    assert!(restored.status.is_terminal());
    assert_eq!(restored.status, StudyStatus::Failed);
    assert_eq!(restored.progress.completed_cells, 3);
    assert_eq!(restored.progress.failed_cells, 7);
    assert!(orchestrator.get_next_jobs(&study.id, 10).await.is_empty());
}

#[tokio::test]
async fn study_completes_through_the_state_machine() {
    let orchestrator = orchestrator();
    let study = orchestrator.create_study(ten_cell_manifest()).await;
    orchestrator.start_study(&study.id).await.unwrap();

    complete_n(&orchestrator, &study.id, 10).await;
    let finished = orchestrator.get_study(&study.id).await.unwrap();
    assert_eq!(finished.status, StudyStatus::Complete);
    assert_eq!(finished.progress.completed_cells, 10);
    assert!((finished.progress.completion_percentage - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn pause_blocks_dispatch_and_resume_restores_it() {
    let orchestrator = orchestrator();
    let study = orchestrator.create_study(ten_cell_manifest()).await;
    orchestrator.start_study(&study.id).await.unwrap();

    orchestrator
        .pause_study(&study.id, "operator requested")
        .await
        .unwrap();
    assert!(orchestrator.get_next_jobs(&study.id, 10).await.is_empty());
    let paused = orchestrator.get_study(&study.id).await.unwrap();
    assert_eq!(paused.status, StudyStatus::Paused);
    assert_eq!(paused.pause_reason.as_deref(), Some("operator requested"));

    orchestrator.resume_study(&study.id).await.unwrap();
    assert_eq!(orchestrator.get_next_jobs(&study.id, 10).await.len(), 10);
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let orchestrator = orchestrator();
    let study = orchestrator.create_study(ten_cell_manifest()).await;

    // Cannot pause a study that never started executing.
    let err = orchestrator.pause_study(&study.id, "nope").await.unwrap_err();
    assert!(err.to_string().contains("illegal study transition"));

    // And resuming a non-paused study is rejected too.
    orchestrator.start_study(&study.id).await.unwrap();
    let err = orchestrator.resume_study(&study.id).await.unwrap_err();
    assert!(err.to_string().contains("illegal study transition"));
}
