//! Study orchestrator - state machine, scheduler and bookkeeping owner
//!
//! Exclusively owns Study, Job and the in-memory job graph. Workers drive it
//! through `get_next_jobs` / `start_job` / `complete_job` / `fail_job`; every
//! mutation keeps the conservation invariant
//! `executing + completed + failed + pending == total` intact. Hooks and the
//! event stream are notified after the state lock is released.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::domain::error::ErrorCode;
use crate::domain::events::StudyEvent;
use crate::domain::job::{CellKey, Job, JobResult, JobStatus, RetryState};
use crate::domain::manifest::ValidatedManifest;
use crate::domain::study::{IllegalTransition, Study, StudyRunSummary, StudyStatus};
use crate::infrastructure::checkpoint::{
    Checkpoint, CheckpointError, CheckpointMetadata, CellResult,
};
use crate::retry::{self, RetryDecision};
use crate::study_engine::graph::JobGraph;
use crate::study_engine::hooks::OrchestratorHooks;
use crate::study_engine::progress::{DeadlineConfig, ProgressTracker};
use crate::utils::SharedClock;
use crate::validation::study_validator::evaluate_study;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("study {0} not found")]
    StudyNotFound(String),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
    #[error("job {job_id} is {actual:?}, expected {expected:?}")]
    InvalidJobState {
        job_id: String,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub deadline: DeadlineConfig,
    /// Event broadcast buffer; slow observers lose the oldest events.
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            deadline: DeadlineConfig::default(),
            event_buffer: 1024,
        }
    }
}

/// Outcome of `complete_job`.
#[derive(Debug)]
pub struct CompleteOutcome {
    pub cell_result: CellResult,
    pub study_status: StudyStatus,
}

/// Outcome of `fail_job`.
#[derive(Debug)]
pub struct FailOutcome {
    pub will_retry: bool,
    pub delay_ms: Option<u64>,
    pub retry_state: RetryState,
    /// Present only when the failure was terminal for the cell.
    pub cell_result: Option<CellResult>,
    pub study_status: StudyStatus,
}

struct StudyEntry {
    study: Study,
    graph: JobGraph,
    tracker: ProgressTracker,
    /// Per-job dispatch locks: ids currently claimed by a worker.
    claimed: std::collections::HashSet<String>,
    /// Consecutive terminal failures per required surface.
    consecutive_failures: HashMap<String, u32>,
    retry_states: HashMap<CellKey, RetryState>,
    retry_rng: fastrand::Rng,
    checkpoint_sequence: u64,
    total_retries: u64,
}

/// Deferred observer work, executed after the state lock is dropped.
enum Notify {
    Transition(StudyStatus, StudyStatus, Study),
    JobStart(Job),
    JobComplete(Job, u64),
    JobFail(Job, ErrorCode, bool),
    DeadlineAtRisk(Study),
    StudyTerminal(Study),
}

pub struct StudyOrchestrator {
    config: OrchestratorConfig,
    clock: SharedClock,
    hooks: OrchestratorHooks,
    studies: RwLock<HashMap<String, StudyEntry>>,
    events: broadcast::Sender<StudyEvent>,
}

impl std::fmt::Debug for StudyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StudyOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StudyOrchestrator {
    pub fn new(config: OrchestratorConfig, hooks: OrchestratorHooks, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer);
        Self {
            config,
            clock,
            hooks,
            studies: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to the study event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<StudyEvent> {
        self.events.subscribe()
    }

    /// Same events as [`subscribe`](Self::subscribe), as a `Stream`.
    pub fn event_stream(&self) -> tokio_stream::wrappers::BroadcastStream<StudyEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.events.subscribe())
    }

    fn emit(&self, event: StudyEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn flush(&self, notifications: Vec<Notify>) {
        let now = self.clock.now();
        for notification in notifications {
            match notification {
                Notify::Transition(from, to, study) => {
                    self.hooks.study_transition(from, to, &study);
                    self.emit(StudyEvent::StudyTransition {
                        study_id: study.id.clone(),
                        from,
                        to,
                        timestamp: now,
                    });
                    match to {
                        StudyStatus::Paused => self.emit(StudyEvent::StudyPaused {
                            study_id: study.id.clone(),
                            reason: study.pause_reason.clone().unwrap_or_default(),
                            timestamp: now,
                        }),
                        StudyStatus::Executing if from == StudyStatus::Paused => {
                            self.emit(StudyEvent::StudyResumed {
                                study_id: study.id.clone(),
                                timestamp: now,
                            });
                        }
                        _ => {}
                    }
                }
                Notify::JobStart(job) => {
                    self.hooks.job_start(&job);
                    self.emit(StudyEvent::JobStarted {
                        study_id: job.study_id.clone(),
                        job_id: job.id.clone(),
                        cell_key: job.cell_key().to_string(),
                        attempt: job.attempts,
                        timestamp: now,
                    });
                }
                Notify::JobComplete(job, duration_ms) => {
                    self.hooks.job_complete(&job);
                    self.emit(StudyEvent::JobCompleted {
                        study_id: job.study_id.clone(),
                        job_id: job.id.clone(),
                        cell_key: job.cell_key().to_string(),
                        duration_ms,
                        timestamp: now,
                    });
                }
                Notify::JobFail(job, code, will_retry) => {
                    self.hooks.job_fail(&job, code);
                    self.emit(StudyEvent::JobFailed {
                        study_id: job.study_id.clone(),
                        job_id: job.id.clone(),
                        cell_key: job.cell_key().to_string(),
                        error_code: code,
                        will_retry,
                        timestamp: now,
                    });
                }
                Notify::DeadlineAtRisk(study) => {
                    self.hooks.deadline_at_risk(&study);
                    self.emit(StudyEvent::DeadlineAtRisk {
                        study_id: study.id.clone(),
                        deadline: study
                            .deadline_status
                            .deadline
                            .unwrap_or(now),
                        projected_completion: study.deadline_status.projected_completion,
                        timestamp: now,
                    });
                }
                Notify::StudyTerminal(study) => {
                    self.emit(StudyEvent::StudyCompleted {
                        study_id: study.id.clone(),
                        status: study.status,
                        timestamp: now,
                    });
                }
            }
        }
    }

    // === Study lifecycle ===

    /// Register a validated manifest as a new study in `manifest_received`.
    pub async fn create_study(&self, manifest: ValidatedManifest) -> Study {
        let now = self.clock.now();
        let study = Study::new(manifest, now);
        let graph = JobGraph::build(&study.id, &study.manifest);
        info!(
            study_id = %study.id,
            name = %study.name,
            cells = graph.jobs.len(),
            "study created"
        );

        let entry = StudyEntry {
            tracker: ProgressTracker::new(self.config.deadline.clone(), now),
            graph,
            claimed: std::collections::HashSet::new(),
            consecutive_failures: HashMap::new(),
            retry_states: HashMap::new(),
            retry_rng: fastrand::Rng::with_seed(
                study.manifest.execution.shuffle_seed.unwrap_or(0x5eed),
            ),
            checkpoint_sequence: 0,
            total_retries: 0,
            study: study.clone(),
        };
        self.studies.write().await.insert(study.id.clone(), entry);
        study
    }

    /// Auto-traverse a fresh study to `executing`.
    pub async fn start_study(&self, study_id: &str) -> Result<Study, OrchestratorError> {
        let mut notifications = Vec::new();
        let study = {
            let mut studies = self.studies.write().await;
            let entry = studies
                .get_mut(study_id)
                .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
            let now = self.clock.now();

            for target in [
                StudyStatus::Validating,
                StudyStatus::Queued,
                StudyStatus::Executing,
            ] {
                let from = entry.study.transition(target, now)?;
                notifications.push(Notify::Transition(from, target, entry.study.clone()));
            }
            entry.study.clone()
        };
        self.flush(notifications);
        Ok(study)
    }

    pub async fn get_study(&self, study_id: &str) -> Option<Study> {
        self.studies
            .read()
            .await
            .get(study_id)
            .map(|e| e.study.clone())
    }

    pub async fn get_job(&self, study_id: &str, job_id: &str) -> Option<Job> {
        self.studies
            .read()
            .await
            .get(study_id)?
            .graph
            .job(job_id)
            .cloned()
    }

    pub async fn pause_study(
        &self,
        study_id: &str,
        reason: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let reason = reason.into();
        let mut notifications = Vec::new();
        {
            let mut studies = self.studies.write().await;
            let entry = studies
                .get_mut(study_id)
                .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
            let now = self.clock.now();
            let from = entry.study.transition(StudyStatus::Paused, now)?;
            entry.study.pause_reason = Some(reason.clone());
            info!(study_id, reason = %reason, "study paused");
            notifications.push(Notify::Transition(
                from,
                StudyStatus::Paused,
                entry.study.clone(),
            ));
        }
        self.flush(notifications);
        Ok(())
    }

    pub async fn resume_study(&self, study_id: &str) -> Result<(), OrchestratorError> {
        let mut notifications = Vec::new();
        {
            let mut studies = self.studies.write().await;
            let entry = studies
                .get_mut(study_id)
                .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
            let now = self.clock.now();
            let from = entry.study.transition(StudyStatus::Executing, now)?;
            info!(study_id, "study resumed");
            notifications.push(Notify::Transition(
                from,
                StudyStatus::Executing,
                entry.study.clone(),
            ));
            // Terminal events may have satisfied completion while paused.
            Self::evaluate_completion(entry, now, &mut notifications);
        }
        self.flush(notifications);
        Ok(())
    }

    /// Force a study into `failed` (fail-fast, operator abort, fatal errors).
    pub async fn fail_study(
        &self,
        study_id: &str,
        reason: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let reason = reason.into();
        let mut notifications = Vec::new();
        {
            let mut studies = self.studies.write().await;
            let entry = studies
                .get_mut(study_id)
                .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
            let now = self.clock.now();
            let from = entry.study.transition(StudyStatus::Failed, now)?;
            entry.study.failure_reason = Some(reason.clone());
            warn!(study_id, reason = %reason, "study failed");
            notifications.push(Notify::Transition(
                from,
                StudyStatus::Failed,
                entry.study.clone(),
            ));
            notifications.push(Notify::StudyTerminal(entry.study.clone()));
        }
        self.flush(notifications);
        Ok(())
    }

    // === Scheduling ===

    /// Up to `limit` dispatchable jobs: pending, unclaimed, retry delay
    /// elapsed. Required-surface jobs precede optional ones; queue order is
    /// preserved within each band.
    pub async fn get_next_jobs(&self, study_id: &str, limit: usize) -> Vec<Job> {
        let now = self.clock.now();
        let studies = self.studies.read().await;
        let Some(entry) = studies.get(study_id) else {
            return Vec::new();
        };
        if entry.study.status != StudyStatus::Executing {
            return Vec::new();
        }

        let mut required = Vec::new();
        let mut optional = Vec::new();
        for job_id in &entry.graph.ready_queue {
            let Some(job) = entry.graph.job(job_id) else {
                continue;
            };
            if job.status != JobStatus::Pending || entry.claimed.contains(job_id) {
                continue;
            }
            if job.next_attempt_at.is_some_and(|at| at > now) {
                continue;
            }
            if entry.study.manifest.is_required_surface(&job.surface_id) {
                required.push(job.clone());
            } else {
                optional.push(job.clone());
            }
        }

        required.into_iter().chain(optional).take(limit).collect()
    }

    /// Claim a pending job for execution: `pending -> executing`.
    pub async fn start_job(&self, study_id: &str, job_id: &str) -> Result<Job, OrchestratorError> {
        let mut notifications = Vec::new();
        let job = {
            let mut studies = self.studies.write().await;
            let entry = studies
                .get_mut(study_id)
                .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
            let now = self.clock.now();

            let job = entry
                .graph
                .job_mut(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
            if job.status != JobStatus::Pending {
                return Err(OrchestratorError::InvalidJobState {
                    job_id: job_id.to_string(),
                    expected: JobStatus::Pending,
                    actual: job.status,
                });
            }
            if !entry.claimed.insert(job_id.to_string()) {
                return Err(OrchestratorError::InvalidJobState {
                    job_id: job_id.to_string(),
                    expected: JobStatus::Pending,
                    actual: JobStatus::Executing,
                });
            }

            job.status = JobStatus::Executing;
            job.attempts += 1;
            job.last_attempt_at = Some(now);
            job.next_attempt_at = None;
            let snapshot = job.clone();

            entry.graph.ready_queue.retain(|id| id != job_id);
            Self::refresh_progress(entry);
            notifications.push(Notify::JobStart(snapshot.clone()));
            snapshot
        };
        self.flush(notifications);
        Ok(job)
    }

    /// Record a successful job: `executing -> complete`, then evaluate the
    /// study-completion predicate.
    pub async fn complete_job(
        &self,
        study_id: &str,
        job_id: &str,
        result: Option<JobResult>,
    ) -> Result<CompleteOutcome, OrchestratorError> {
        let mut notifications = Vec::new();
        let outcome = {
            let mut studies = self.studies.write().await;
            let entry = studies
                .get_mut(study_id)
                .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
            let now = self.clock.now();

            let job = entry
                .graph
                .job_mut(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
            if job.status != JobStatus::Executing {
                return Err(OrchestratorError::InvalidJobState {
                    job_id: job_id.to_string(),
                    expected: JobStatus::Executing,
                    actual: job.status,
                });
            }

            job.status = JobStatus::Complete;
            job.result = result;
            let duration_ms = job
                .last_attempt_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            let snapshot = job.clone();

            entry.claimed.remove(job_id);
            entry.graph.completed.insert(job_id.to_string());
            entry
                .consecutive_failures
                .insert(snapshot.surface_id.clone(), 0);
            entry.retry_states.remove(&snapshot.cell_key());

            let cost = snapshot.result.as_ref().and_then(|r| r.cost_usd);
            if let Some(cost) = cost {
                entry.study.costs.total_usd += cost;
                entry.study.costs.surface_usd += cost;
            }

            entry.tracker.record_terminal(now);
            Self::refresh_progress(entry);
            Self::check_deadline(entry, now, &mut notifications);
            Self::check_cost_cap(entry, now, &mut notifications);
            notifications.push(Notify::JobComplete(snapshot.clone(), duration_ms));

            Self::evaluate_completion(entry, now, &mut notifications);

            CompleteOutcome {
                cell_result: CellResult {
                    cell_key: snapshot.cell_key(),
                    success: true,
                    completed_at: now,
                    duration_ms: Some(duration_ms),
                    response_length: snapshot
                        .result
                        .as_ref()
                        .map(|r| r.validation.response_length),
                    error_code: None,
                    error_message: None,
                },
                study_status: entry.study.status,
            }
        };
        self.flush(notifications);
        Ok(outcome)
    }

    /// Record a failed attempt. Retryable failures re-enter the ready queue
    /// with backoff; terminal failures move the cell to `failed` and may
    /// fail-fast the study.
    pub async fn fail_job(
        &self,
        study_id: &str,
        job_id: &str,
        error_message: impl Into<String>,
        error_code: ErrorCode,
    ) -> Result<FailOutcome, OrchestratorError> {
        let error_message = error_message.into();
        let mut notifications = Vec::new();
        let outcome = {
            let mut studies = self.studies.write().await;
            let entry = studies
                .get_mut(study_id)
                .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
            let now = self.clock.now();
            let retry_config = entry.study.manifest.execution.retry.clone();

            let job = entry
                .graph
                .job_mut(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
            if job.status != JobStatus::Executing {
                return Err(OrchestratorError::InvalidJobState {
                    job_id: job_id.to_string(),
                    expected: JobStatus::Executing,
                    actual: job.status,
                });
            }

            // attempts was incremented by start_job; the policy takes the
            // zero-based index of the attempt that just failed.
            let failed_attempt = job.attempts.saturating_sub(1);
            let decision = retry::evaluate(
                error_code,
                failed_attempt,
                &retry_config,
                &mut entry.retry_rng,
            );

            let cell_key = job.cell_key();
            let outcome = match decision {
                RetryDecision::Retry { delay_ms } => {
                    let job = entry.graph.job_mut(job_id).expect("job exists");
                    job.status = JobStatus::Pending;
                    let next_attempt_at =
                        now + chrono::Duration::milliseconds(delay_ms as i64);
                    job.next_attempt_at = Some(next_attempt_at);
                    let snapshot = job.clone();

                    entry.claimed.remove(job_id);
                    entry.graph.ready_queue.push_back(job_id.to_string());
                    entry.total_retries += 1;

                    let retry_state = RetryState {
                        attempts: snapshot.attempts,
                        last_error: Some(error_message.clone()),
                        last_error_code: Some(error_code),
                        next_retry_time: Some(next_attempt_at),
                        exhausted: false,
                    };
                    entry.retry_states.insert(cell_key, retry_state.clone());

                    debug!(
                        study_id,
                        job_id,
                        attempt = snapshot.attempts,
                        delay_ms,
                        code = %error_code,
                        "job scheduled for retry"
                    );
                    notifications.push(Notify::JobFail(snapshot, error_code, true));
                    Self::refresh_progress(entry);

                    FailOutcome {
                        will_retry: true,
                        delay_ms: Some(delay_ms),
                        retry_state,
                        cell_result: None,
                        study_status: entry.study.status,
                    }
                }
                RetryDecision::GiveUp => {
                    let job = entry.graph.job_mut(job_id).expect("job exists");
                    job.status = JobStatus::Failed;
                    let snapshot = job.clone();

                    entry.claimed.remove(job_id);
                    entry.graph.failed.insert(job_id.to_string());

                    let retry_state = RetryState {
                        attempts: snapshot.attempts,
                        last_error: Some(error_message.clone()),
                        last_error_code: Some(error_code),
                        next_retry_time: None,
                        exhausted: true,
                    };
                    entry.retry_states.insert(cell_key.clone(), retry_state.clone());

                    warn!(
                        study_id,
                        job_id,
                        attempts = snapshot.attempts,
                        code = %error_code,
                        "job failed terminally"
                    );

                    entry.tracker.record_terminal(now);
                    Self::refresh_progress(entry);
                    Self::check_deadline(entry, now, &mut notifications);
                    notifications.push(Notify::JobFail(snapshot.clone(), error_code, false));

                    // Fail-fast accounting for required surfaces.
                    let mut study_failed = false;
                    if entry
                        .study
                        .manifest
                        .is_required_surface(&snapshot.surface_id)
                    {
                        let streak = {
                            let counter = entry
                                .consecutive_failures
                                .entry(snapshot.surface_id.clone())
                                .or_insert(0);
                            *counter += 1;
                            *counter
                        };
                        let limit = entry
                            .study
                            .manifest
                            .completion_criteria
                            .consecutive_failure_limit;
                        if limit > 0 && streak >= limit {
                            study_failed = Self::fail_study_locked(
                                entry,
                                now,
                                format!(
                                    "surface '{}' hit {} consecutive failures",
                                    snapshot.surface_id, streak
                                ),
                                &mut notifications,
                            );
                        }
                    }

                    if !study_failed {
                        Self::evaluate_completion(entry, now, &mut notifications);
                    }

                    FailOutcome {
                        will_retry: false,
                        delay_ms: None,
                        retry_state,
                        cell_result: Some(CellResult {
                            cell_key,
                            success: false,
                            completed_at: now,
                            duration_ms: None,
                            response_length: None,
                            error_code: Some(error_code),
                            error_message: Some(error_message),
                        }),
                        study_status: entry.study.status,
                    }
                }
            };
            outcome
        };
        self.flush(notifications);
        Ok(outcome)
    }

    /// Cancel every non-terminal job in a scope (whole study, or one
    /// surface), transitioning each to `failed` with the given code. Used by
    /// the per-surface and per-study timeout scopes. In-flight workers whose
    /// job was cancelled underneath them get an `InvalidJobState` rejection
    /// when they report back, which they log and drop.
    pub async fn cancel_outstanding(
        &self,
        study_id: &str,
        surface_id: Option<&str>,
        error_code: ErrorCode,
        message: &str,
    ) -> Result<usize, OrchestratorError> {
        let mut notifications = Vec::new();
        let cancelled = {
            let mut studies = self.studies.write().await;
            let entry = studies
                .get_mut(study_id)
                .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
            let now = self.clock.now();

            let job_ids: Vec<String> = entry
                .graph
                .jobs
                .values()
                .filter(|j| !j.is_terminal())
                .filter(|j| surface_id.is_none_or(|s| j.surface_id == s))
                .map(|j| j.id.clone())
                .collect();

            for job_id in &job_ids {
                let job = entry.graph.job_mut(job_id).expect("listed job exists");
                job.status = JobStatus::Failed;
                let snapshot = job.clone();

                entry.claimed.remove(job_id);
                entry.graph.ready_queue.retain(|id| id != job_id);
                entry.graph.failed.insert(job_id.clone());
                entry.retry_states.insert(
                    snapshot.cell_key(),
                    RetryState {
                        attempts: snapshot.attempts,
                        last_error: Some(message.to_string()),
                        last_error_code: Some(error_code),
                        next_retry_time: None,
                        exhausted: true,
                    },
                );
                notifications.push(Notify::JobFail(snapshot, error_code, false));
            }

            if !job_ids.is_empty() {
                warn!(
                    study_id,
                    surface_id = surface_id.unwrap_or("*"),
                    cancelled = job_ids.len(),
                    code = %error_code,
                    "outstanding jobs cancelled"
                );
                entry.tracker.record_terminal(now);
                Self::refresh_progress(entry);
                Self::evaluate_completion(entry, now, &mut notifications);
            }
            job_ids.len()
        };
        self.flush(notifications);
        Ok(cancelled)
    }

    /// Recompute rate/deadline state; fires the at-risk hook on the edge.
    /// Runners call this on a timer.
    pub async fn tick_progress(&self, study_id: &str) -> Result<(), OrchestratorError> {
        let mut notifications = Vec::new();
        {
            let mut studies = self.studies.write().await;
            let entry = studies
                .get_mut(study_id)
                .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
            let now = self.clock.now();
            Self::check_deadline(entry, now, &mut notifications);
        }
        self.flush(notifications);
        Ok(())
    }

    // === Checkpointing ===

    /// Deep snapshot of the study's execution state.
    pub async fn create_checkpoint(
        &self,
        study_id: &str,
    ) -> Result<Checkpoint, OrchestratorError> {
        let mut studies = self.studies.write().await;
        let entry = studies
            .get_mut(study_id)
            .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
        let now = self.clock.now();
        entry.checkpoint_sequence += 1;

        let manifest = &entry.study.manifest;
        let mut checkpoint = Checkpoint::new(
            &entry.study.id,
            &entry.study.name,
            entry.graph.initial_order.clone(),
            CheckpointMetadata {
                surfaces: manifest.surfaces.iter().map(|s| s.id.clone()).collect(),
                locations: manifest.locations.iter().map(|l| l.id.clone()).collect(),
                query_count: manifest.queries.len(),
                legal_hold: manifest.legal_hold,
            },
            entry.study.created_at,
        );
        checkpoint.sequence_number = entry.checkpoint_sequence;
        checkpoint.updated_at = now;

        for job_id in entry.graph.completed.iter().chain(entry.graph.failed.iter()) {
            let Some(job) = entry.graph.job(job_id) else {
                continue;
            };
            let success = job.status == JobStatus::Complete;
            checkpoint.cell_results.insert(
                job.cell_key(),
                CellResult {
                    cell_key: job.cell_key(),
                    success,
                    completed_at: job.last_attempt_at.unwrap_or(now),
                    duration_ms: None,
                    response_length: job.result.as_ref().map(|r| r.validation.response_length),
                    error_code: job.result.as_ref().and_then(|r| r.error.as_ref()).map(|e| e.code),
                    error_message: job
                        .result
                        .as_ref()
                        .and_then(|r| r.error.as_ref())
                        .map(|e| e.message.clone()),
                },
            );
        }
        checkpoint.completed_cells = entry.graph.completed.len() as u64;
        checkpoint.failed_cells = entry.graph.failed.len() as u64;
        checkpoint.progress_percent = if checkpoint.total_cells == 0 {
            100
        } else {
            (((checkpoint.completed_cells + checkpoint.failed_cells) as f64
                / checkpoint.total_cells as f64)
                * 100.0)
                .round() as u32
        };
        checkpoint.retry_states = entry.retry_states.clone();

        entry.study.last_checkpoint_at = Some(now);
        let snapshot = checkpoint.clone();
        drop(studies);

        self.hooks.checkpoint_created(&snapshot);
        self.emit(StudyEvent::CheckpointSaved {
            study_id: study_id.to_string(),
            sequence_number: snapshot.sequence_number,
            completed_cells: snapshot.completed_cells,
            timestamp: self.clock.now(),
        });
        Ok(checkpoint)
    }

    /// Replace the in-memory job graph so completed jobs and progress match
    /// the checkpoint; everything else reverts to `pending` with attempts
    /// preserved, in original ready order.
    ///
    /// Completion is re-evaluated afterwards: a snapshot whose cells are all
    /// terminal must drive an executing study to a terminal status rather
    /// than leave it waiting on jobs that will never become ready.
    pub async fn restore_from_checkpoint(
        &self,
        study_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), OrchestratorError> {
        let mut notifications = Vec::new();
        {
            let mut studies = self.studies.write().await;
            let entry = studies
                .get_mut(study_id)
                .ok_or_else(|| OrchestratorError::StudyNotFound(study_id.to_string()))?;
            let now = self.clock.now();

            entry.claimed.clear();
            entry.graph.completed.clear();
            entry.graph.failed.clear();
            entry.graph.ready_queue.clear();
            entry.retry_states = checkpoint.retry_states.clone();

            for cell_key in &checkpoint.execution_queue {
                let Some(job_id) = entry.graph.by_cell.get(cell_key).cloned() else {
                    warn!(study_id, cell = %cell_key, "checkpoint cell unknown to this manifest");
                    continue;
                };
                let attempts = checkpoint
                    .retry_states
                    .get(cell_key)
                    .map_or(0, |r| r.attempts);
                let job = entry.graph.job_mut(&job_id).expect("indexed job exists");

                match checkpoint.cell_results.get(cell_key) {
                    Some(result) if result.success => {
                        job.status = JobStatus::Complete;
                        entry.graph.completed.insert(job_id);
                    }
                    Some(_) => {
                        job.status = JobStatus::Failed;
                        job.attempts = attempts;
                        entry.graph.failed.insert(job_id);
                    }
                    None => {
                        job.status = JobStatus::Pending;
                        job.attempts = attempts;
                        job.result = None;
                        job.next_attempt_at = None;
                        entry.graph.ready_queue.push_back(job_id);
                    }
                }
            }

            Self::refresh_progress(entry);
            info!(
                study_id,
                completed = entry.graph.completed.len(),
                remaining = entry.graph.ready_queue.len(),
                "restored from checkpoint"
            );
            Self::evaluate_completion(entry, now, &mut notifications);
        }
        self.flush(notifications);
        Ok(())
    }

    /// Final report for a terminal (or any) study.
    pub async fn run_summary(&self, study_id: &str) -> Option<StudyRunSummary> {
        let studies = self.studies.read().await;
        let entry = studies.get(study_id)?;
        let counts = entry.graph.surface_counts();
        let mut surface_completion = HashMap::new();
        for (surface_id, c) in &counts {
            let rate = if c.total == 0 {
                0.0
            } else {
                c.completed as f64 / c.total as f64
            };
            surface_completion.insert(surface_id.clone(), rate);
        }
        let mut failure_histogram: HashMap<String, u64> = HashMap::new();
        for state in entry.retry_states.values().filter(|s| s.exhausted) {
            let key = state
                .last_error_code
                .map_or("UNKNOWN".to_string(), |c| c.as_str().to_string());
            *failure_histogram.entry(key).or_insert(0) += 1;
        }

        Some(StudyRunSummary {
            study_id: entry.study.id.clone(),
            study_name: entry.study.name.clone(),
            status: entry.study.status,
            total_cells: entry.study.progress.total_cells,
            completed_cells: entry.study.progress.completed_cells,
            failed_cells: entry.study.progress.failed_cells,
            total_retries: entry.total_retries,
            wall_clock_seconds: (self.clock.now() - entry.study.created_at).num_seconds(),
            surface_completion,
            failure_histogram,
            costs: entry.study.costs.clone(),
        })
    }

    // === Internal helpers (entry-scoped, lock held) ===

    fn refresh_progress(entry: &mut StudyEntry) {
        let progress = &mut entry.study.progress;
        progress.executing_cells = entry.graph.executing_count();
        progress.completed_cells = entry.graph.completed.len() as u64;
        progress.failed_cells = entry.graph.failed.len() as u64;
        progress.recompute_percentage();
    }

    fn check_deadline(
        entry: &mut StudyEntry,
        now: DateTime<Utc>,
        notifications: &mut Vec<Notify>,
    ) {
        let flipped = entry.tracker.update(
            &mut entry.study.progress,
            &mut entry.study.deadline_status,
            now,
        );
        if flipped {
            warn!(study_id = %entry.study.id, "study deadline at risk");
            notifications.push(Notify::DeadlineAtRisk(entry.study.clone()));
        }
    }

    fn check_cost_cap(
        entry: &mut StudyEntry,
        now: DateTime<Utc>,
        notifications: &mut Vec<Notify>,
    ) {
        let Some(cap) = entry.study.manifest.max_cost_usd else {
            return;
        };
        if entry.study.costs.total_usd >= cap
            && entry.study.status == StudyStatus::Executing
            && entry.study.transition(StudyStatus::Paused, now).is_ok()
        {
            entry.study.pause_reason = Some("cost_cap".to_string());
            warn!(
                study_id = %entry.study.id,
                spent = entry.study.costs.total_usd,
                cap,
                "cost cap reached; study paused"
            );
            notifications.push(Notify::Transition(
                StudyStatus::Executing,
                StudyStatus::Paused,
                entry.study.clone(),
            ));
        }
    }

    /// Evaluate the completion predicate; drive the study to a terminal
    /// state when it is decided.
    fn evaluate_completion(
        entry: &mut StudyEntry,
        now: DateTime<Utc>,
        notifications: &mut Vec<Notify>,
    ) {
        if entry.study.status != StudyStatus::Executing {
            return;
        }

        let report = evaluate_study(
            &entry.study.manifest.completion_criteria,
            &entry.graph.surface_counts(),
        );

        if report.can_complete {
            for warning in &report.warnings {
                debug!(study_id = %entry.study.id, warning, "completion warning");
            }
            if Self::transition_chain(
                entry,
                now,
                &[StudyStatus::ValidatingResults, StudyStatus::Complete],
                notifications,
            ) {
                info!(study_id = %entry.study.id, "study complete");
                notifications.push(Notify::StudyTerminal(entry.study.clone()));
            }
        } else if entry.graph.is_settled() {
            // Nothing left to run and the threshold is unreachable.
            if Self::transition_chain(
                entry,
                now,
                &[StudyStatus::ValidatingResults, StudyStatus::Failed],
                notifications,
            ) {
                entry.study.failure_reason =
                    Some("completion criteria not met after all cells settled".to_string());
                notifications.push(Notify::StudyTerminal(entry.study.clone()));
            }
        }
    }

    fn transition_chain(
        entry: &mut StudyEntry,
        now: DateTime<Utc>,
        targets: &[StudyStatus],
        notifications: &mut Vec<Notify>,
    ) -> bool {
        for target in targets {
            match entry.study.transition(*target, now) {
                Ok(from) => {
                    notifications.push(Notify::Transition(from, *target, entry.study.clone()));
                }
                Err(e) => {
                    warn!(study_id = %entry.study.id, error = %e, "completion transition rejected");
                    return false;
                }
            }
        }
        true
    }

    fn fail_study_locked(
        entry: &mut StudyEntry,
        now: DateTime<Utc>,
        reason: String,
        notifications: &mut Vec<Notify>,
    ) -> bool {
        match entry.study.transition(StudyStatus::Failed, now) {
            Ok(from) => {
                entry.study.failure_reason = Some(reason.clone());
                warn!(study_id = %entry.study.id, reason = %reason, "study failed fast");
                notifications.push(Notify::Transition(
                    from,
                    StudyStatus::Failed,
                    entry.study.clone(),
                ));
                notifications.push(Notify::StudyTerminal(entry.study.clone()));
                true
            }
            Err(e) => {
                warn!(study_id = %entry.study.id, error = %e, "fail-fast transition rejected");
                false
            }
        }
    }
}
