//! Pool manager - one credential pool per surface, lazily created
//!
//! Bridges the vault (payload owner) and the pools (selection + usage
//! owners). Acquiring a credential consults the pool for an id and the vault
//! for the payload; results are reported back to the owning pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::credentials::pool::{CredentialPool, CredentialPoolConfig, PoolStats};
use crate::domain::credential::Credential;
use crate::infrastructure::vault::{CredentialVault, VaultError};
use crate::utils::SharedClock;

#[derive(Debug)]
pub struct CredentialPoolManager {
    vault: Arc<dyn CredentialVault>,
    default_config: CredentialPoolConfig,
    clock: SharedClock,
    pools: Mutex<HashMap<String, Arc<CredentialPool>>>,
}

impl CredentialPoolManager {
    pub fn new(
        vault: Arc<dyn CredentialVault>,
        default_config: CredentialPoolConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            vault,
            default_config,
            clock,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Get or lazily create the pool for a surface, seeded with the vault's
    /// currently active credentials.
    pub async fn pool_for(&self, surface_id: &str) -> Result<Arc<CredentialPool>, VaultError> {
        {
            let pools = self.pools.lock().await;
            if let Some(pool) = pools.get(surface_id) {
                return Ok(Arc::clone(pool));
            }
        }

        let active = self.vault.get_active_by_surface(surface_id).await?;
        let pool = Arc::new(CredentialPool::new(
            surface_id,
            self.default_config.clone(),
            Arc::clone(&self.clock),
        ));
        for credential in &active {
            pool.add_credential(credential.id());
        }
        debug!(
            surface_id,
            credentials = active.len(),
            "credential pool created"
        );

        let mut pools = self.pools.lock().await;
        // Another task may have raced us; first insert wins.
        Ok(Arc::clone(
            pools
                .entry(surface_id.to_string())
                .or_insert(pool),
        ))
    }

    /// Re-sync a pool's membership with the vault's active credential set.
    pub async fn refresh_pool(&self, surface_id: &str) -> Result<(), VaultError> {
        let pool = self.pool_for(surface_id).await?;
        let active = self.vault.get_active_by_surface(surface_id).await?;
        let active_ids: Vec<&str> = active.iter().map(|c| c.id()).collect();

        for id in pool.credential_ids() {
            if !active_ids.contains(&id.as_str()) {
                pool.remove_credential(&id);
            }
        }
        for credential in &active {
            pool.add_credential(credential.id());
        }
        Ok(())
    }

    /// Select a credential for a surface and fetch its payload.
    pub async fn acquire(&self, surface_id: &str) -> Result<Option<Credential>, VaultError> {
        let pool = self.pool_for(surface_id).await?;
        let Some(credential_id) = pool.get_next() else {
            return Ok(None);
        };
        match self.vault.get(&credential_id).await? {
            Some(credential) => Ok(Some(credential)),
            None => {
                // Vault entry vanished under the pool; drop the stale id.
                pool.remove_credential(&credential_id);
                Ok(None)
            }
        }
    }

    /// Report usage outcome to the pool that owns the credential.
    pub async fn report_result(&self, surface_id: &str, credential_id: &str, success: bool) {
        let pools = self.pools.lock().await;
        if let Some(pool) = pools.get(surface_id) {
            pool.report_result(credential_id, success);
        }
    }

    pub async fn stats(&self) -> Vec<PoolStats> {
        let pools = self.pools.lock().await;
        let mut stats: Vec<PoolStats> = pools.values().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| a.surface_id.cmp(&b.surface_id));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::vault::MemoryVault;
    use crate::utils::system_clock;
    use chrono::Utc;

    async fn seeded_manager() -> (CredentialPoolManager, Vec<String>) {
        let vault = Arc::new(MemoryVault::new(system_clock()));
        let mut ids = Vec::new();
        for key in ["sk-1", "sk-2"] {
            let credential = Credential::api_key("openai-api", key, Utc::now());
            ids.push(credential.id().to_string());
            vault.store(credential).await.unwrap();
        }
        let manager = CredentialPoolManager::new(
            vault,
            CredentialPoolConfig::default(),
            system_clock(),
        );
        (manager, ids)
    }

    #[tokio::test]
    async fn pool_is_created_lazily_and_seeded() {
        let (manager, ids) = seeded_manager().await;
        let pool = manager.pool_for("openai-api").await.unwrap();
        let mut members = pool.credential_ids();
        members.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(members, expected);

        // Second call returns the same pool instance.
        let again = manager.pool_for("openai-api").await.unwrap();
        assert!(Arc::ptr_eq(&pool, &again));
    }

    #[tokio::test]
    async fn acquire_round_robins_and_reports() {
        let (manager, ids) = seeded_manager().await;
        let first = manager.acquire("openai-api").await.unwrap().unwrap();
        let second = manager.acquire("openai-api").await.unwrap().unwrap();
        assert_ne!(first.id(), second.id());
        assert!(ids.contains(&first.id().to_string()));

        manager.report_result("openai-api", first.id(), true).await;
        let stats = manager.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_credentials, 2);
    }

    #[tokio::test]
    async fn acquire_on_unknown_surface_is_none() {
        let (manager, _) = seeded_manager().await;
        assert!(manager.acquire("no-such-surface").await.unwrap().is_none());
    }
}
