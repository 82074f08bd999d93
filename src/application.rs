//! Application facade - wires the engine together
//!
//! Builds the orchestrator, managers and runner out of an [`AppConfig`] and
//! exposes the handful of entry points a host (service, scheduler, test
//! harness) actually needs: submit, run, pause/resume, shutdown, stats.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::accounts::AccountManager;
use crate::credentials::CredentialPoolManager;
use crate::domain::manifest::{
    ManifestRegistries, ManifestValidation, ManifestWarning, StudyManifest, validate_manifest,
};
use crate::domain::study::{Study, StudyRunSummary};
use crate::infrastructure::checkpoint::{CheckpointManager, CheckpointStore};
use crate::infrastructure::config::{AppConfig, ConfigManager};
use crate::infrastructure::vault::{CredentialVault, MemoryVault};
use crate::proxy::ProxyManager;
use crate::study_engine::adapter::{AdapterRegistry, SurfaceAdapter};
use crate::study_engine::hooks::OrchestratorHooks;
use crate::study_engine::orchestrator::{OrchestratorConfig, StudyOrchestrator};
use crate::study_engine::runner::{RunnerConfig, StudyRunner};
use crate::utils::{SharedClock, system_clock};
use crate::validation::JobValidator;

/// Builder for a fully wired engine.
pub struct EngineBuilder {
    config: AppConfig,
    clock: SharedClock,
    vault: Option<Arc<dyn CredentialVault>>,
    adapters: AdapterRegistry,
    hooks: OrchestratorHooks,
    registries: ManifestRegistries,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clock: system_clock(),
            vault: None,
            adapters: AdapterRegistry::new(),
            hooks: OrchestratorHooks::default(),
            registries: ManifestRegistries::default(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SurfaceAdapter>) -> Self {
        self.adapters.register(adapter);
        self
    }

    pub fn with_hooks(mut self, hooks: OrchestratorHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_registries(mut self, registries: ManifestRegistries) -> Self {
        self.registries = registries;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let clock = self.clock;
        let vault = self
            .vault
            .unwrap_or_else(|| Arc::new(MemoryVault::new(Arc::clone(&clock))));

        let checkpoint_dir = match &self.config.engine.checkpoint_dir {
            Some(dir) => dir.clone(),
            None => ConfigManager::get_app_data_dir()
                .context("cannot resolve checkpoint directory")?
                .join("checkpoints"),
        };

        let accounts = AccountManager::new(self.config.accounts.clone(), Arc::clone(&clock));
        accounts.start_sweeper();
        let proxies = ProxyManager::new(self.config.proxies.clone(), Arc::clone(&clock));
        let credentials = Arc::new(CredentialPoolManager::new(
            Arc::clone(&vault),
            self.config.credential_pools.clone(),
            Arc::clone(&clock),
        ));
        let validator = Arc::new(JobValidator::new(self.config.validator.clone()));
        let orchestrator = Arc::new(StudyOrchestrator::new(
            OrchestratorConfig {
                deadline: self.config.engine.deadline.clone(),
                ..OrchestratorConfig::default()
            },
            self.hooks,
            Arc::clone(&clock),
        ));

        info!(checkpoint_dir = %checkpoint_dir.display(), "engine assembled");
        Ok(Engine {
            config: self.config,
            clock,
            vault,
            adapters: Arc::new(self.adapters),
            accounts,
            proxies,
            credentials,
            validator,
            orchestrator,
            checkpoint_dir,
            registries: self.registries,
        })
    }
}

/// Assembled execution engine.
pub struct Engine {
    config: AppConfig,
    clock: SharedClock,
    vault: Arc<dyn CredentialVault>,
    adapters: Arc<AdapterRegistry>,
    accounts: Arc<AccountManager>,
    proxies: Arc<ProxyManager>,
    credentials: Arc<CredentialPoolManager>,
    validator: Arc<JobValidator>,
    orchestrator: Arc<StudyOrchestrator>,
    checkpoint_dir: std::path::PathBuf,
    registries: ManifestRegistries,
}

/// A submitted study plus the validation warnings it arrived with.
#[derive(Debug)]
pub struct Submission {
    pub study: Study,
    pub warnings: Vec<ManifestWarning>,
}

impl Engine {
    /// Validate a manifest at the boundary and register the study.
    pub async fn submit_study(&self, manifest: StudyManifest) -> Result<Submission> {
        match validate_manifest(manifest, &self.registries, self.clock.now()) {
            ManifestValidation::Valid { manifest, warnings } => {
                let study = self.orchestrator.create_study(*manifest).await;
                Ok(Submission { study, warnings })
            }
            ManifestValidation::Invalid { errors, .. } => {
                let rendered: Vec<String> = errors
                    .iter()
                    .map(|e| format!("{}: {} ({})", e.field, e.message, e.constraint))
                    .collect();
                anyhow::bail!("manifest rejected: {}", rendered.join("; "))
            }
        }
    }

    /// Build a runner bound to one study's checkpoint file.
    pub fn runner_for(&self, study: &Study) -> StudyRunner {
        let store = CheckpointStore::new(&self.checkpoint_dir);
        let checkpoints = Arc::new(CheckpointManager::new(
            store,
            study.manifest.execution.checkpoint.clone(),
            Arc::clone(&self.clock),
        ));
        StudyRunner::new(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.adapters),
            Arc::clone(&self.accounts),
            Arc::clone(&self.proxies),
            Arc::clone(&self.credentials),
            Arc::clone(&self.validator),
            checkpoints,
            RunnerConfig::default(),
        )
    }

    /// Submit and drive a study to a terminal state in one call.
    pub async fn execute_study(&self, manifest: StudyManifest) -> Result<StudyRunSummary> {
        let submission = self.submit_study(manifest).await?;
        let runner = self.runner_for(&submission.study);
        let summary = runner.run_study(&submission.study.id).await?;
        Ok(summary)
    }

    pub fn orchestrator(&self) -> &Arc<StudyOrchestrator> {
        &self.orchestrator
    }

    pub fn accounts(&self) -> &Arc<AccountManager> {
        &self.accounts
    }

    pub fn proxies(&self) -> &Arc<ProxyManager> {
        &self.proxies
    }

    pub fn credentials(&self) -> &Arc<CredentialPoolManager> {
        &self.credentials
    }

    pub fn validator(&self) -> &Arc<JobValidator> {
        &self.validator
    }

    pub fn vault(&self) -> &Arc<dyn CredentialVault> {
        &self.vault
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Remove expired checkpoints per the retention policy.
    pub async fn cleanup_checkpoints(&self) -> Result<usize> {
        let store = CheckpointStore::new(&self.checkpoint_dir);
        let removed = store
            .cleanup(
                chrono::Duration::days(i64::from(
                    self.config.engine.checkpoint_retention_days,
                )),
                self.clock.now(),
            )
            .await?;
        Ok(removed)
    }

    /// Stop background tasks. Engine methods must not be called afterwards.
    pub fn shutdown(&self) {
        self.accounts.stop_sweeper();
        self.proxies.stop_health_monitor();
    }
}
