//! Credential vault - back-end-agnostic credential storage
//!
//! Three back-ends share one trait: an in-memory store for development and
//! tests, a read-only environment scanner, and an encrypted file vault
//! (AES-256-GCM, scrypt-derived key). `get_active_by_surface` is the hot
//! path every pool refresh goes through.

pub mod encrypted_file;
pub mod env;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::credential::{Credential, CredentialType};

pub use encrypted_file::EncryptedFileVault;
pub use env::EnvVault;
pub use memory::MemoryVault;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("credential {0} not found")]
    NotFound(String),
    #[error("credential {0} already exists")]
    AlreadyExists(String),
    #[error("vault backend is read-only")]
    ReadOnly,
    #[error("vault authentication failed (wrong master password or corrupted file)")]
    Authentication,
    #[error("vault i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("vault serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("vault crypto failure: {0}")]
    Crypto(String),
}

/// Storage boundary every vault back-end implements.
#[async_trait]
pub trait CredentialVault: Send + Sync + std::fmt::Debug {
    async fn store(&self, credential: Credential) -> Result<(), VaultError>;

    async fn update(&self, credential: Credential) -> Result<(), VaultError>;

    /// Returns whether a credential was actually removed.
    async fn delete(&self, credential_id: &str) -> Result<bool, VaultError>;

    async fn get(&self, credential_id: &str) -> Result<Option<Credential>, VaultError>;

    async fn exists(&self, credential_id: &str) -> Result<bool, VaultError> {
        Ok(self.get(credential_id).await?.is_some())
    }

    async fn list(&self) -> Result<Vec<Credential>, VaultError>;

    async fn list_by_type(
        &self,
        credential_type: CredentialType,
    ) -> Result<Vec<Credential>, VaultError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.credential_type() == credential_type)
            .collect())
    }

    async fn get_by_surface(&self, surface_id: &str) -> Result<Vec<Credential>, VaultError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.surface_id() == surface_id)
            .collect())
    }

    /// Only credentials that are flagged active and not expired.
    async fn get_active_by_surface(&self, surface_id: &str) -> Result<Vec<Credential>, VaultError>;
}
