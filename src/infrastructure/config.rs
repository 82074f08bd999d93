//! Configuration infrastructure
//!
//! Engine-level settings (everything that is not part of a study manifest)
//! live in a single JSON file under the user's config directory, overlaid
//! with `BENTHAM_`-prefixed environment variables. Organized in two tiers:
//! operator-facing settings and engine-managed state the application updates
//! on its own.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::accounts::AccountManagerConfig;
use crate::credentials::CredentialPoolConfig;
use crate::proxy::ProxyManagerConfig;
use crate::study_engine::progress::DeadlineConfig;
use crate::validation::JobValidatorConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load config: {source}")]
    FileLoad {
        #[from]
        source: config::ConfigError,
    },
    #[error("configuration validation failed: {message}")]
    Validation { message: String },
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Operator-facing settings.
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub accounts: AccountManagerConfig,
    #[serde(default)]
    pub credential_pools: CredentialPoolConfig,
    #[serde(default)]
    pub proxies: ProxyManagerConfig,
    #[serde(default)]
    pub validator: JobValidatorConfig,
    /// Engine-managed settings (updated by the application itself).
    #[serde(default)]
    pub app_managed: AppManagedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for study checkpoint snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
    /// Days a finished study's checkpoint is retained by `cleanup`.
    #[serde(default = "default_checkpoint_retention_days")]
    pub checkpoint_retention_days: u32,
    #[serde(default)]
    pub deadline: DeadlineConfig,
    /// Path to the encrypted credential vault, when that backend is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_path: Option<PathBuf>,
}

fn default_checkpoint_retention_days() -> u32 {
    defaults::CHECKPOINT_RETENTION_DAYS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            checkpoint_retention_days: defaults::CHECKPOINT_RETENTION_DAYS,
            deadline: DeadlineConfig::default(),
            vault_path: None,
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    /// Enable JSON formatted logs
    pub json_format: bool,
    /// Enable console output
    pub console_output: bool,
    /// Enable file output
    pub file_output: bool,
    /// Module-specific log level filters (e.g., "reqwest": "warn")
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("reqwest".to_string(), "warn".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("tokio".to_string(), "info".to_string());
                filters.insert("bentham".to_string(), "info".to_string());
                filters
            },
        }
    }
}

/// Settings the engine updates on its own across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppManagedConfig {
    /// Timestamp of the last fully completed study.
    pub last_successful_study: Option<String>,
    /// Cells per hour observed on recent runs, for deadline projections.
    pub recent_rate_per_hour: Option<f64>,
    /// Configuration version for migration purposes.
    pub config_version: u32,
}

impl Default for AppManagedConfig {
    fn default() -> Self {
        Self {
            last_successful_study: None,
            recent_rate_per_hour: None,
            config_version: 1,
        }
    }
}

/// Configuration manager for loading and saving settings.
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory.
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("bentham");
        Ok(config_dir)
    }

    /// Get application data directory (checkpoints, vault, logs).
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join("bentham");
        Ok(data_dir)
    }

    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;
        Ok(Self {
            config_path: config_dir.join("bentham_config.json"),
        })
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// First-run initialization: create directories and a default config.
    pub async fn initialize_on_first_run(&self) -> Result<AppConfig> {
        let config_dir = self
            .config_path
            .parent()
            .context("Failed to get config directory")?;
        if !config_dir.exists() {
            fs::create_dir_all(config_dir)
                .await
                .context("Failed to create config directory")?;
            info!("✅ Created configuration directory: {:?}", config_dir);
        }

        if !self.config_path.exists() {
            info!("🎉 First run detected - initializing default configuration");
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            self.create_data_directories().await?;
            Ok(default_config)
        } else {
            self.load_config().await
        }
    }

    async fn create_data_directories(&self) -> Result<()> {
        let app_data_dir = Self::get_app_data_dir()?;
        let directories = [
            app_data_dir.join("checkpoints"),
            app_data_dir.join("vault"),
            app_data_dir.join("logs"),
        ];
        for dir in &directories {
            if !dir.exists() {
                fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("Failed to create directory: {:?}", dir))?;
                info!("📁 Created directory: {:?}", dir);
            }
        }
        Ok(())
    }

    /// Load configuration from file, creating default if it doesn't exist.
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Configuration file not found, creating default: {:?}",
                self.config_path
            );
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;
        let config: AppConfig =
            serde_json::from_str(&content).context("Failed to parse configuration file")?;
        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(config)
    }

    /// File + environment layered load: `BENTHAM_` variables override the
    /// file (e.g. `BENTHAM_LOGGING__LEVEL=debug`).
    pub fn load_with_env(&self) -> Result<AppConfig, ConfigError> {
        let mut builder = config::Config::builder();
        if self.config_path.exists() {
            builder = builder.add_source(config::File::from(self.config_path.clone()));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("BENTHAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: AppConfig = settings.try_deserialize()?;
        if config.engine.checkpoint_retention_days == 0 {
            return Err(ConfigError::Validation {
                message: "checkpoint_retention_days must be at least 1".to_string(),
            });
        }
        Ok(config)
    }

    /// Save configuration to file.
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }
        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;
        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Update app-managed settings (like the observed completion rate).
    pub async fn update_app_managed<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut AppManagedConfig),
    {
        let mut config = self.load_config().await?;
        updater(&mut config.app_managed);
        self.save_config(&config).await
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

/// Default engine configuration values.
pub mod defaults {
    /// Days a finished study's checkpoint is kept around.
    pub const CHECKPOINT_RETENTION_DAYS: u32 = 30;

    // Logging defaults
    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.json"));

        let mut config = AppConfig::default();
        config.logging.level = "debug".to_string();
        config.engine.checkpoint_retention_days = 7;
        manager.save_config(&config).await.unwrap();

        let loaded = manager.load_config().await.unwrap();
        assert_eq!(loaded.logging.level, "debug");
        assert_eq!(loaded.engine.checkpoint_retention_days, 7);
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.json"));
        let config = manager.load_config().await.unwrap();
        assert_eq!(config.logging.level, defaults::LOG_LEVEL);
        assert!(manager.config_path().exists());
    }

    #[tokio::test]
    async fn app_managed_updater_persists() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.json"));
        manager.save_config(&AppConfig::default()).await.unwrap();

        manager
            .update_app_managed(|managed| {
                managed.recent_rate_per_hour = Some(420.0);
            })
            .await
            .unwrap();

        let loaded = manager.load_config().await.unwrap();
        assert_eq!(loaded.app_managed.recent_rate_per_hour, Some(420.0));
    }
}
