//! Study runner - the worker pool around the orchestrator
//!
//! Dispatches ready jobs to surface adapters under the study's concurrency
//! caps, wiring in account checkout, credential selection, proxy leasing,
//! validation, retry classification and checkpoint auto-saves. One runner
//! drives one study at a time; `shutdown` cancels workers, waits a bounded
//! grace period and flushes a final checkpoint.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts::AccountManager;
use crate::credentials::CredentialPoolManager;
use crate::domain::account::CheckoutRequest;
use crate::domain::error::ErrorCode;
use crate::domain::job::{Evidence, Job, JobResult};
use crate::domain::manifest::{EvidenceLevel, StudyManifest};
use crate::domain::study::{StudyRunSummary, StudyStatus};
use crate::infrastructure::checkpoint::{CheckpointError, CheckpointManager, can_resume};
use crate::proxy::{ProxyManager, ProxyRequest};
use crate::study_engine::adapter::{AdapterRegistry, QueryContext};
use crate::study_engine::orchestrator::{OrchestratorError, StudyOrchestrator};
use crate::validation::{JobValidationRequest, JobValidator, ValidationStatus};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("study {0} not found")]
    StudyNotFound(String),
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Poll interval while no job is dispatchable.
    pub idle_poll_ms: u64,
    /// Grace period for in-flight jobs on shutdown.
    pub shutdown_grace_ms: u64,
    /// Rough per-query transfer assumption used for proxy cost accrual.
    pub assumed_mb_per_query: f64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: 100,
            shutdown_grace_ms: 10_000,
            assumed_mb_per_query: 1.0,
        }
    }
}

/// Shared context handed to every worker task.
struct RunnerCtx {
    orchestrator: Arc<StudyOrchestrator>,
    adapters: Arc<AdapterRegistry>,
    accounts: Arc<AccountManager>,
    proxies: Arc<ProxyManager>,
    credentials: Arc<CredentialPoolManager>,
    validator: Arc<JobValidator>,
    checkpoints: Arc<CheckpointManager>,
    config: RunnerConfig,
    study_id: String,
    manifest: StudyManifest,
    surface_semaphores: HashMap<String, Arc<Semaphore>>,
}

pub struct StudyRunner {
    orchestrator: Arc<StudyOrchestrator>,
    adapters: Arc<AdapterRegistry>,
    accounts: Arc<AccountManager>,
    proxies: Arc<ProxyManager>,
    credentials: Arc<CredentialPoolManager>,
    validator: Arc<JobValidator>,
    checkpoints: Arc<CheckpointManager>,
    config: RunnerConfig,
    cancel: CancellationToken,
}

impl StudyRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orchestrator: Arc<StudyOrchestrator>,
        adapters: Arc<AdapterRegistry>,
        accounts: Arc<AccountManager>,
        proxies: Arc<ProxyManager>,
        credentials: Arc<CredentialPoolManager>,
        validator: Arc<JobValidator>,
        checkpoints: Arc<CheckpointManager>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            orchestrator,
            adapters,
            accounts,
            proxies,
            credentials,
            validator,
            checkpoints,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel workers; the driving `run_study` call winds down and flushes.
    pub fn shutdown(&self) {
        info!("study runner shutdown requested");
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive a study to a terminal state (or until shutdown).
    pub async fn run_study(&self, study_id: &str) -> Result<StudyRunSummary, RunnerError> {
        let study = self
            .orchestrator
            .get_study(study_id)
            .await
            .ok_or_else(|| RunnerError::StudyNotFound(study_id.to_string()))?;
        let manifest = study.manifest.manifest().clone();

        // Resume from a prior snapshot when one is usable.
        if let Some(existing) = self.checkpoints.store().load(study_id).await? {
            let check = can_resume(&existing);
            if check.can_resume {
                info!(
                    study_id,
                    remaining = check.remaining_cells,
                    "resuming study from checkpoint"
                );
                self.orchestrator
                    .restore_from_checkpoint(study_id, &existing)
                    .await?;
                self.checkpoints.install(existing).await;
            }
        }
        if self.checkpoints.current().await.is_none() {
            let checkpoint = self.orchestrator.create_checkpoint(study_id).await?;
            self.checkpoints.install(checkpoint).await;
        }

        if study.status == StudyStatus::ManifestReceived {
            self.orchestrator.start_study(study_id).await?;
        }

        let surface_semaphores: HashMap<String, Arc<Semaphore>> = manifest
            .surfaces
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    Arc::new(Semaphore::new(
                        manifest.execution.concurrency_per_surface as usize,
                    )),
                )
            })
            .collect();
        let global = Arc::new(Semaphore::new(manifest.execution.max_concurrency as usize));

        let ctx = Arc::new(RunnerCtx {
            orchestrator: Arc::clone(&self.orchestrator),
            adapters: Arc::clone(&self.adapters),
            accounts: Arc::clone(&self.accounts),
            proxies: Arc::clone(&self.proxies),
            credentials: Arc::clone(&self.credentials),
            validator: Arc::clone(&self.validator),
            checkpoints: Arc::clone(&self.checkpoints),
            config: self.config.clone(),
            study_id: study_id.to_string(),
            manifest,
            surface_semaphores,
        });

        let mut workers: JoinSet<()> = JoinSet::new();
        let idle = std::time::Duration::from_millis(self.config.idle_poll_ms);
        let run_started = std::time::Instant::now();
        let mut surface_started: HashMap<String, std::time::Instant> = HashMap::new();
        let mut timed_out_surfaces: std::collections::HashSet<String> =
            std::collections::HashSet::new();

        loop {
            while workers.try_join_next().is_some() {}

            if self.cancel.is_cancelled() {
                break;
            }

            let Some(study) = self.orchestrator.get_study(study_id).await else {
                break;
            };
            if study.status.is_terminal() {
                break;
            }
            if study.status == StudyStatus::Paused {
                tokio::time::sleep(idle).await;
                continue;
            }

            // Timeout scopes: whole study, then per surface.
            let timeouts = &ctx.manifest.execution.timeouts;
            if let Some(study_timeout) = timeouts.study_timeout_ms {
                if run_started.elapsed().as_millis() as u64 >= study_timeout {
                    self.orchestrator
                        .cancel_outstanding(
                            study_id,
                            None,
                            ErrorCode::Timeout,
                            "study timeout elapsed",
                        )
                        .await?;
                    continue;
                }
            }
            if let Some(surface_timeout) = timeouts.surface_timeout_ms {
                for (surface_id, started) in surface_started.clone() {
                    if started.elapsed().as_millis() as u64 >= surface_timeout
                        && timed_out_surfaces.insert(surface_id.clone())
                    {
                        self.orchestrator
                            .cancel_outstanding(
                                study_id,
                                Some(&surface_id),
                                ErrorCode::Timeout,
                                "surface timeout elapsed",
                            )
                            .await?;
                    }
                }
            }

            self.orchestrator.tick_progress(study_id).await?;

            let capacity = global.available_permits();
            if capacity == 0 {
                tokio::time::sleep(idle).await;
                continue;
            }

            let jobs = self.orchestrator.get_next_jobs(study_id, capacity).await;
            if jobs.is_empty() {
                tokio::time::sleep(idle).await;
                continue;
            }

            let mut dispatched = 0usize;
            for job in jobs {
                let Ok(global_permit) = Arc::clone(&global).try_acquire_owned() else {
                    break;
                };
                let Some(surface_semaphore) = ctx.surface_semaphores.get(&job.surface_id) else {
                    drop(global_permit);
                    continue;
                };
                let Ok(surface_permit) = Arc::clone(surface_semaphore).try_acquire_owned() else {
                    drop(global_permit);
                    continue;
                };

                surface_started
                    .entry(job.surface_id.clone())
                    .or_insert_with(std::time::Instant::now);
                let ctx = Arc::clone(&ctx);
                dispatched += 1;
                workers.spawn(async move {
                    let _global = global_permit;
                    let _surface = surface_permit;
                    execute_job(&ctx, job).await;
                });
            }

            if dispatched == 0 {
                tokio::time::sleep(idle).await;
            }
        }

        // Bounded grace for in-flight jobs, then final flush.
        let grace = std::time::Duration::from_millis(self.config.shutdown_grace_ms);
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(study_id, "grace period elapsed; aborting in-flight jobs");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        if let Err(e) = self.checkpoints.force_save().await {
            warn!(study_id, error = %e, "final checkpoint save failed");
        }

        let study = self.orchestrator.get_study(study_id).await;
        if study.as_ref().is_some_and(|s| s.status.is_terminal()) {
            self.checkpoints.finalize().await?;
        }

        self.orchestrator
            .run_summary(study_id)
            .await
            .ok_or_else(|| RunnerError::StudyNotFound(study_id.to_string()))
    }
}

/// One job end to end: claim, resources, dispatch, validate, settle.
async fn execute_job(ctx: &RunnerCtx, job: Job) {
    let job = match ctx.orchestrator.start_job(&ctx.study_id, &job.id).await {
        Ok(job) => job,
        // Lost the claim race; another worker owns it now.
        Err(e) => {
            debug!(job_id = %job.id, error = %e, "job claim lost");
            return;
        }
    };

    // Pace consecutive dispatches per the manifest's delay band.
    let (delay_min, delay_max) = ctx.manifest.execution.query_delay_ms;
    if delay_max > 0 {
        let delay = if delay_max > delay_min {
            fastrand::u64(delay_min..=delay_max)
        } else {
            delay_min
        };
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }

    let Some(adapter) = ctx.adapters.get(&job.surface_id) else {
        settle_failure(
            ctx,
            &job,
            ErrorCode::SurfaceUnavailable,
            format!("no adapter registered for surface '{}'", job.surface_id),
        )
        .await;
        return;
    };

    // Account checkout for authenticated surfaces.
    let checkout = if adapter.requires_auth() {
        let location = ctx
            .manifest
            .locations
            .iter()
            .find(|l| l.id == job.location_id);
        let mut request = CheckoutRequest::new(&job.surface_id, &ctx.manifest.tenant_id);
        request.session_duration_secs = location
            .and_then(|l| l.session_duration_minutes)
            .map(|m| u64::from(m) * 60);
        request.purpose = Some(format!("study:{}", ctx.study_id));
        match ctx.accounts.checkout(request).await {
            Some(checkout) => Some(checkout),
            None if adapter.supports_anonymous() => None,
            None => {
                // Backpressure: no account slot free counts as rate limiting.
                settle_failure(
                    ctx,
                    &job,
                    ErrorCode::RateLimited,
                    format!("no available account for surface '{}'", job.surface_id),
                )
                .await;
                return;
            }
        }
    } else {
        None
    };
    let account_id = checkout.as_ref().map(|c| c.account_id.clone());

    let credential = match ctx.credentials.acquire(&job.surface_id).await {
        Ok(credential) => credential,
        Err(e) => {
            warn!(surface_id = %job.surface_id, error = %e, "credential acquisition failed");
            None
        }
    };
    let credential_id = credential.as_ref().map(|c| c.id().to_string());

    // Proxy lease per the cell's location.
    let location = ctx
        .manifest
        .locations
        .iter()
        .find(|l| l.id == job.location_id);
    let lease = match location {
        Some(location) => {
            let request = ProxyRequest {
                location: Some(location.id.clone()),
                proxy_type: Some(location.proxy_type),
                provider: Some(location.proxy_provider.clone()),
                session_id: None,
                target: Some(job.surface_id.clone()),
                pool_id: None,
                exclude: Vec::new(),
                require_sticky: location.require_sticky,
                session_duration_minutes: location.session_duration_minutes,
            };
            match ctx.proxies.request_proxy(request).await {
                Ok(lease) => Some(lease),
                Err(e) => {
                    if let Some(checkout) = &checkout {
                        ctx.accounts.checkin(&checkout.id, false).await;
                    }
                    settle_failure(ctx, &job, ErrorCode::ProxyError, e.to_string()).await;
                    return;
                }
            }
        }
        None => None,
    };
    let proxy_id = lease.as_ref().map(|l| l.proxy.id.clone());

    let context = QueryContext {
        session_id: lease
            .as_ref()
            .and_then(|l| l.session_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        proxy: lease.as_ref().map(|l| l.proxy.clone()),
        account_id: account_id.clone(),
        credential,
        timeout_ms: ctx.manifest.execution.timeouts.query_timeout_ms,
        evidence_level: ctx.manifest.evidence_level,
    };

    let query_text = ctx
        .manifest
        .queries
        .get(job.query_index)
        .map(|q| q.text.clone())
        .unwrap_or_default();

    let timeout = std::time::Duration::from_millis(context.timeout_ms);
    let started = std::time::Instant::now();
    let dispatch = tokio::time::timeout(timeout, adapter.execute_query(&query_text, &context)).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let outcome: Result<JobResult, (ErrorCode, String)> = match dispatch {
        Err(_) => Err((
            ErrorCode::Timeout,
            format!("adapter call exceeded {}ms", context.timeout_ms),
        )),
        Ok(Err(engine_error)) => Err((engine_error.code, engine_error.message)),
        Ok(Ok(result)) if !result.success => {
            let (code, message) = result.error.as_ref().map_or(
                (ErrorCode::InternalError, "adapter reported failure".to_string()),
                |e| (e.code, e.message.clone()),
            );
            Err((code, message))
        }
        Ok(Ok(result)) => Ok(result),
    };

    match outcome {
        Ok(mut result) => {
            // Attach evidence when the adapter did not capture any.
            if ctx.manifest.evidence_level != EvidenceLevel::None && result.evidence.is_none() {
                if let Some(response) = &result.response {
                    result.evidence = Some(Evidence::for_text(&response.text));
                }
            }
            result.context.session_id = context.session_id.clone();
            result.context.account_id = account_id.clone();
            if result.context.proxy_ip.is_none() {
                result.context.proxy_ip = lease.as_ref().map(|l| l.proxy.host.clone());
            }

            // Accrue estimated proxy spend for this query.
            if let Some(lease) = &lease {
                let proxy_cost =
                    lease.proxy.cost_per_gb * ctx.config.assumed_mb_per_query / 1024.0;
                result.cost_usd = Some(result.cost_usd.unwrap_or(0.0) + proxy_cost);
            }

            // Quality gates decide whether "success" stands.
            let report = ctx.validator.validate(&JobValidationRequest {
                job_id: &job.id,
                surface_id: &job.surface_id,
                result: Some(&result),
                quality_gates: &ctx.manifest.quality_gates,
                evidence_level: ctx.manifest.evidence_level,
            });

            if report.status == ValidationStatus::Failed {
                let reasons: Vec<String> = report
                    .failed_checks()
                    .map(|c| c.message.clone())
                    .collect();
                release_resources(ctx, &job.surface_id, &checkout, &credential_id, &proxy_id, false, latency_ms)
                    .await;
                settle_failure(
                    ctx,
                    &job,
                    ErrorCode::InvalidResponse,
                    format!("quality gates failed: {}", reasons.join("; ")),
                )
                .await;
                return;
            }

            release_resources(ctx, &job.surface_id, &checkout, &credential_id, &proxy_id, true, latency_ms).await;

            match ctx
                .orchestrator
                .complete_job(&ctx.study_id, &job.id, Some(result))
                .await
            {
                Ok(outcome) => {
                    if let Err(e) = ctx.checkpoints.record_result(outcome.cell_result).await {
                        warn!(job_id = %job.id, error = %e, "checkpoint auto-save failed");
                    }
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "complete_job rejected"),
            }
        }
        Err((code, message)) => {
            release_resources(ctx, &job.surface_id, &checkout, &credential_id, &proxy_id, false, latency_ms)
                .await;
            settle_failure(ctx, &job, code, message).await;
        }
    }
}

async fn release_resources(
    ctx: &RunnerCtx,
    surface_id: &str,
    checkout: &Option<crate::domain::account::AccountCheckout>,
    credential_id: &Option<String>,
    proxy_id: &Option<String>,
    success: bool,
    latency_ms: u64,
) {
    if let Some(checkout) = checkout {
        ctx.accounts.checkin(&checkout.id, success).await;
    }
    if let Some(credential_id) = credential_id {
        ctx.credentials
            .report_result(surface_id, credential_id, success)
            .await;
    }
    if let Some(proxy_id) = proxy_id {
        ctx.proxies
            .report_result(proxy_id, success, Some(latency_ms), None)
            .await;
    }
}

/// Report a failure to the orchestrator and persist the retry/terminal state.
async fn settle_failure(ctx: &RunnerCtx, job: &Job, code: ErrorCode, message: String) {
    match ctx
        .orchestrator
        .fail_job(&ctx.study_id, &job.id, message, code)
        .await
    {
        Ok(outcome) => {
            ctx.checkpoints
                .record_retry(job.cell_key(), outcome.retry_state.clone())
                .await;
            if let Some(cell_result) = outcome.cell_result {
                if let Err(e) = ctx.checkpoints.record_result(cell_result).await {
                    warn!(job_id = %job.id, error = %e, "checkpoint auto-save failed");
                }
            }
        }
        Err(e) => warn!(job_id = %job.id, error = %e, "fail_job rejected"),
    }
}
