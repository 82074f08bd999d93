//! Infrastructure module - configuration, logging, persistence, vault

pub mod checkpoint;
pub mod config;
pub mod logging;
pub mod vault;

pub use checkpoint::{
    CHECKPOINT_VERSION, CellResult, Checkpoint, CheckpointError, CheckpointManager,
    CheckpointMetadata, CheckpointStore, CheckpointSummary, ResumeCheck,
};
pub use config::{AppConfig, AppManagedConfig, ConfigError, ConfigManager, EngineConfig, LoggingConfig};
pub use logging::{init_logging, init_logging_with_config};
pub use vault::{CredentialVault, EncryptedFileVault, EnvVault, MemoryVault, VaultError};
