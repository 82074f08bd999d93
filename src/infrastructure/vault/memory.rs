//! In-memory vault back-end for development and tests

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::credential::Credential;
use crate::infrastructure::vault::{CredentialVault, VaultError};
use crate::utils::SharedClock;

#[derive(Debug)]
pub struct MemoryVault {
    credentials: RwLock<HashMap<String, Credential>>,
    clock: SharedClock,
}

impl MemoryVault {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            credentials: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.credentials.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.credentials.read().await.is_empty()
    }
}

#[async_trait]
impl CredentialVault for MemoryVault {
    async fn store(&self, credential: Credential) -> Result<(), VaultError> {
        let mut credentials = self.credentials.write().await;
        let id = credential.id().to_string();
        if credentials.contains_key(&id) {
            return Err(VaultError::AlreadyExists(id));
        }
        credentials.insert(id, credential);
        Ok(())
    }

    async fn update(&self, credential: Credential) -> Result<(), VaultError> {
        let mut credentials = self.credentials.write().await;
        let id = credential.id().to_string();
        if !credentials.contains_key(&id) {
            return Err(VaultError::NotFound(id));
        }
        credentials.insert(id, credential);
        Ok(())
    }

    async fn delete(&self, credential_id: &str) -> Result<bool, VaultError> {
        Ok(self.credentials.write().await.remove(credential_id).is_some())
    }

    async fn get(&self, credential_id: &str) -> Result<Option<Credential>, VaultError> {
        Ok(self.credentials.read().await.get(credential_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Credential>, VaultError> {
        let mut all: Vec<Credential> = self.credentials.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.base().created_at.cmp(&b.base().created_at));
        Ok(all)
    }

    async fn get_active_by_surface(&self, surface_id: &str) -> Result<Vec<Credential>, VaultError> {
        let now = self.clock.now();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.surface_id() == surface_id && c.is_active_at(now))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credential::CredentialType;
    use crate::utils::system_clock;
    use chrono::Utc;

    #[tokio::test]
    async fn store_get_update_delete() {
        let vault = MemoryVault::new(system_clock());
        let credential = Credential::api_key("openai-api", "sk-1", Utc::now());
        let id = credential.id().to_string();

        vault.store(credential.clone()).await.unwrap();
        assert!(vault.exists(&id).await.unwrap());
        assert!(matches!(
            vault.store(credential.clone()).await,
            Err(VaultError::AlreadyExists(_))
        ));

        let mut updated = credential;
        updated.base_mut().is_active = false;
        vault.update(updated).await.unwrap();
        let fetched = vault.get(&id).await.unwrap().unwrap();
        assert!(!fetched.base().is_active);

        assert!(vault.delete(&id).await.unwrap());
        assert!(!vault.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn active_filter_excludes_expired_and_disabled() {
        let vault = MemoryVault::new(system_clock());
        let now = Utc::now();

        let active = Credential::api_key("openai-api", "sk-ok", now);
        let mut expired = Credential::api_key("openai-api", "sk-old", now);
        expired.base_mut().expires_at = Some(now - chrono::Duration::hours(1));
        let mut disabled = Credential::api_key("openai-api", "sk-off", now);
        disabled.base_mut().is_active = false;
        let other_surface = Credential::api_key("google-search", "sk-g", now);

        for c in [active.clone(), expired, disabled, other_surface] {
            vault.store(c).await.unwrap();
        }

        let result = vault.get_active_by_surface("openai-api").await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id(), active.id());
    }

    #[tokio::test]
    async fn list_by_type_filters() {
        let vault = MemoryVault::new(system_clock());
        vault
            .store(Credential::api_key("s1", "k", Utc::now()))
            .await
            .unwrap();
        let by_type = vault.list_by_type(CredentialType::ApiKey).await.unwrap();
        assert_eq!(by_type.len(), 1);
        let none = vault
            .list_by_type(CredentialType::BearerToken)
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
