//! Account manager - registry, pools and checkout/checkin of surface accounts
//!
//! Accounts and their usage counters are owned here exclusively; pools hold
//! account ids only. The per-account concurrency cap is enforced by the
//! manager, never by callers. A background sweep expires stale checkouts and
//! is safe to race with concurrent checkins.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::account::{
    Account, AccountCheckout, AccountPool, AccountStatus, AccountUsage, CheckoutRequest,
};
use crate::utils::SharedClock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountManagerConfig {
    /// Upper bound on any checkout lifetime, seconds.
    #[serde(default = "default_max_checkout_duration")]
    pub max_checkout_duration_secs: u64,
    /// Cooldown applied after a failed checkin when the account itself does
    /// not specify one.
    #[serde(default = "default_cooldown_seconds")]
    pub default_cooldown_seconds: u64,
    #[serde(default = "default_true")]
    pub cooldown_on_failure: bool,
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Cap used when an account does not declare `max_concurrent`.
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: u32,
}

fn default_max_checkout_duration() -> u64 {
    3600
}
fn default_cooldown_seconds() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_cleanup_interval() -> u64 {
    60
}
fn default_max_concurrent() -> u32 {
    1
}

impl Default for AccountManagerConfig {
    fn default() -> Self {
        Self {
            max_checkout_duration_secs: default_max_checkout_duration(),
            default_cooldown_seconds: default_cooldown_seconds(),
            cooldown_on_failure: true,
            auto_cleanup: true,
            cleanup_interval_secs: default_cleanup_interval(),
            default_max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("account {0} not found")]
    AccountNotFound(String),
    #[error("account {0} already registered")]
    DuplicateAccount(String),
    #[error("pool {0} not found")]
    PoolNotFound(String),
    #[error("account {account_id} surface '{account_surface}' does not match pool surface '{pool_surface}'")]
    SurfaceMismatch {
        account_id: String,
        account_surface: String,
        pool_surface: String,
    },
}

/// Aggregate stats for operational introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountManagerStats {
    pub total_accounts: usize,
    pub available_accounts: usize,
    pub active_checkouts: usize,
    pub accounts_in_cooldown: usize,
    pub total_requests: u64,
}

#[derive(Debug, Default)]
struct AccountsState {
    accounts: HashMap<String, Account>,
    usage: HashMap<String, AccountUsage>,
    pools: HashMap<String, AccountPool>,
    checkouts: HashMap<String, AccountCheckout>,
}

#[derive(Debug)]
pub struct AccountManager {
    config: AccountManagerConfig,
    clock: SharedClock,
    state: Mutex<AccountsState>,
    sweeper: CancellationToken,
}

impl AccountManager {
    pub fn new(config: AccountManagerConfig, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            state: Mutex::new(AccountsState::default()),
            sweeper: CancellationToken::new(),
        })
    }

    // === Registry ===

    pub async fn add_account(&self, account: Account) -> Result<(), AccountError> {
        let mut state = self.state.lock().await;
        if state.accounts.contains_key(&account.id) {
            return Err(AccountError::DuplicateAccount(account.id));
        }
        state.usage.insert(
            account.id.clone(),
            AccountUsage {
                account_id: account.id.clone(),
                ..AccountUsage::default()
            },
        );
        info!(account_id = %account.id, surface_id = %account.surface_id, "account registered");
        state.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    /// Remove an account, its usage, pool memberships and live checkouts.
    pub async fn remove_account(&self, account_id: &str) -> Result<(), AccountError> {
        let mut state = self.state.lock().await;
        if state.accounts.remove(account_id).is_none() {
            return Err(AccountError::AccountNotFound(account_id.to_string()));
        }
        state.usage.remove(account_id);
        for pool in state.pools.values_mut() {
            pool.account_ids.retain(|id| id != account_id);
        }
        state.checkouts.retain(|_, c| c.account_id != account_id);
        Ok(())
    }

    pub async fn get_account(&self, account_id: &str) -> Option<Account> {
        self.state.lock().await.accounts.get(account_id).cloned()
    }

    pub async fn get_all_accounts(&self) -> Vec<Account> {
        let mut all: Vec<Account> = self.state.lock().await.accounts.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn get_tenant_accounts(&self, tenant_id: &str) -> Vec<Account> {
        self.state
            .lock()
            .await
            .accounts
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn get_surface_accounts(&self, surface_id: &str) -> Vec<Account> {
        self.state
            .lock()
            .await
            .accounts
            .values()
            .filter(|a| a.surface_id == surface_id)
            .cloned()
            .collect()
    }

    pub async fn update_account(&self, account: Account) -> Result<(), AccountError> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&account.id) {
            return Err(AccountError::AccountNotFound(account.id));
        }
        state.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    pub async fn set_account_status(
        &self,
        account_id: &str,
        status: AccountStatus,
    ) -> Result<(), AccountError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| AccountError::AccountNotFound(account_id.to_string()))?;
        account.status = status;
        account.updated_at = now;
        Ok(())
    }

    pub async fn set_enabled(&self, account_id: &str, enabled: bool) -> Result<(), AccountError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| AccountError::AccountNotFound(account_id.to_string()))?;
        account.enabled = enabled;
        account.updated_at = now;
        Ok(())
    }

    pub async fn get_usage(&self, account_id: &str) -> Option<AccountUsage> {
        self.state.lock().await.usage.get(account_id).cloned()
    }

    // === Pools ===

    pub async fn create_pool(
        &self,
        name: impl Into<String>,
        surface_id: impl Into<String>,
    ) -> AccountPool {
        let pool = AccountPool {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            surface_id: surface_id.into(),
            account_ids: Vec::new(),
            created_at: self.clock.now(),
        };
        self.state
            .lock()
            .await
            .pools
            .insert(pool.id.clone(), pool.clone());
        pool
    }

    pub async fn remove_pool(&self, pool_id: &str) -> bool {
        self.state.lock().await.pools.remove(pool_id).is_some()
    }

    pub async fn get_pool(&self, pool_id: &str) -> Option<AccountPool> {
        self.state.lock().await.pools.get(pool_id).cloned()
    }

    pub async fn get_surface_pools(&self, surface_id: &str) -> Vec<AccountPool> {
        self.state
            .lock()
            .await
            .pools
            .values()
            .filter(|p| p.surface_id == surface_id)
            .cloned()
            .collect()
    }

    /// Membership requires the account's surface to match the pool's surface.
    pub async fn add_to_pool(&self, pool_id: &str, account_id: &str) -> Result<(), AccountError> {
        let mut state = self.state.lock().await;
        let account_surface = state
            .accounts
            .get(account_id)
            .ok_or_else(|| AccountError::AccountNotFound(account_id.to_string()))?
            .surface_id
            .clone();
        let pool = state
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| AccountError::PoolNotFound(pool_id.to_string()))?;
        if pool.surface_id != account_surface {
            return Err(AccountError::SurfaceMismatch {
                account_id: account_id.to_string(),
                account_surface,
                pool_surface: pool.surface_id.clone(),
            });
        }
        if !pool.account_ids.iter().any(|id| id == account_id) {
            pool.account_ids.push(account_id.to_string());
        }
        Ok(())
    }

    pub async fn remove_from_pool(&self, pool_id: &str, account_id: &str) -> Result<bool, AccountError> {
        let mut state = self.state.lock().await;
        let pool = state
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| AccountError::PoolNotFound(pool_id.to_string()))?;
        let before = pool.account_ids.len();
        pool.account_ids.retain(|id| id != account_id);
        Ok(pool.account_ids.len() != before)
    }

    // === Availability ===

    fn account_available(
        &self,
        account: &Account,
        usage: &AccountUsage,
        now: DateTime<Utc>,
    ) -> bool {
        if !account.enabled || account.status != AccountStatus::Active {
            return false;
        }
        if usage.cooldown_ends_at.is_some_and(|end| end > now) {
            return false;
        }
        let cap = account
            .max_concurrent
            .unwrap_or(self.config.default_max_concurrent);
        usage.active_sessions < cap
    }

    /// enabled AND active AND not cooling down AND below the concurrency cap.
    pub async fn is_available(&self, account_id: &str) -> bool {
        let now = self.clock.now();
        let state = self.state.lock().await;
        match (state.accounts.get(account_id), state.usage.get(account_id)) {
            (Some(account), Some(usage)) => self.account_available(account, usage, now),
            _ => false,
        }
    }

    // === Checkout / checkin ===

    /// Reserve one concurrency slot on the best available account, or `None`
    /// when nothing qualifies.
    pub async fn checkout(&self, request: CheckoutRequest) -> Option<AccountCheckout> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let pool_members: Option<Vec<String>> = match &request.pool_id {
            Some(pool_id) => Some(state.pools.get(pool_id)?.account_ids.clone()),
            None => None,
        };

        let mut candidates: Vec<String> = state
            .accounts
            .values()
            .filter(|a| a.surface_id == request.surface_id && a.tenant_id == request.tenant_id)
            .filter(|a| {
                pool_members
                    .as_ref()
                    .is_none_or(|members| members.iter().any(|id| *id == a.id))
            })
            .filter(|a| !request.exclude.iter().any(|id| *id == a.id))
            .filter(|a| {
                state
                    .usage
                    .get(&a.id)
                    .is_some_and(|u| self.account_available(a, u, now))
            })
            .map(|a| a.id.clone())
            .collect();

        if !request.prefer.is_empty() {
            let preferred: Vec<String> = candidates
                .iter()
                .filter(|id| request.prefer.iter().any(|p| p == *id))
                .cloned()
                .collect();
            if !preferred.is_empty() {
                candidates = preferred;
            }
        }

        // Least-recently-used, never-used first; account id breaks ties.
        candidates.sort_by(|a, b| {
            let last_a = state.usage.get(a).and_then(|u| u.last_used_at);
            let last_b = state.usage.get(b).and_then(|u| u.last_used_at);
            match (last_a, last_b) {
                (None, None) => a.cmp(b),
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(ta), Some(tb)) => ta.cmp(&tb).then_with(|| a.cmp(b)),
            }
        });
        let account_id = candidates.first()?.clone();

        let duration_secs = request
            .session_duration_secs
            .unwrap_or(self.config.max_checkout_duration_secs)
            .min(self.config.max_checkout_duration_secs);

        let checkout = AccountCheckout {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.clone(),
            checked_out_at: now,
            expires_at: now + chrono::Duration::seconds(duration_secs as i64),
            purpose: request.purpose,
            session_id: request.session_id,
        };

        if let Some(usage) = state.usage.get_mut(&account_id) {
            usage.active_sessions += 1;
            usage.last_used_at = Some(now);
        }
        state.checkouts.insert(checkout.id.clone(), checkout.clone());
        debug!(
            account_id = %account_id,
            checkout_id = %checkout.id,
            expires_at = %checkout.expires_at,
            "account checked out"
        );
        Some(checkout)
    }

    /// Release a checkout and record the outcome. Returns false for unknown
    /// (or already swept) checkout ids.
    pub async fn checkin(&self, checkout_id: &str, success: bool) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(checkout) = state.checkouts.remove(checkout_id) else {
            return false;
        };

        let cooldown = {
            let account = state.accounts.get(&checkout.account_id);
            account.and_then(|a| a.cooldown_seconds)
        }
        .unwrap_or(self.config.default_cooldown_seconds);

        if let Some(usage) = state.usage.get_mut(&checkout.account_id) {
            usage.request_count += 1;
            if success {
                usage.success_count += 1;
            } else {
                usage.failed_count += 1;
                if self.config.cooldown_on_failure {
                    usage.cooldown_ends_at = Some(now + chrono::Duration::seconds(cooldown as i64));
                }
            }
            usage.active_sessions = usage.active_sessions.saturating_sub(1);
        }
        true
    }

    pub async fn get_checkout(&self, checkout_id: &str) -> Option<AccountCheckout> {
        self.state.lock().await.checkouts.get(checkout_id).cloned()
    }

    pub async fn get_active_checkouts(&self) -> Vec<AccountCheckout> {
        self.state.lock().await.checkouts.values().cloned().collect()
    }

    /// Expire checkouts past their deadline. Idempotent: each expired
    /// checkout releases exactly one slot, however often this runs.
    pub async fn cleanup_expired_checkouts(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let expired: Vec<AccountCheckout> = state
            .checkouts
            .values()
            .filter(|c| c.is_expired(now))
            .cloned()
            .collect();

        for checkout in &expired {
            state.checkouts.remove(&checkout.id);
            if let Some(usage) = state.usage.get_mut(&checkout.account_id) {
                usage.active_sessions = usage.active_sessions.saturating_sub(1);
            }
            warn!(
                checkout_id = %checkout.id,
                account_id = %checkout.account_id,
                "expired checkout swept"
            );
        }
        expired.len()
    }

    /// Health report from an external probe: may flip status and clear or
    /// extend the cooldown.
    pub async fn report_health_check(
        &self,
        account_id: &str,
        healthy: bool,
        status_override: Option<AccountStatus>,
    ) -> Result<(), AccountError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| AccountError::AccountNotFound(account_id.to_string()))?;

        if let Some(status) = status_override {
            account.status = status;
        } else if healthy && account.status == AccountStatus::Suspended {
            account.status = AccountStatus::Active;
        } else if !healthy && account.status == AccountStatus::Active {
            account.status = AccountStatus::Suspended;
        }
        account.updated_at = now;

        let cooldown_secs = account
            .cooldown_seconds
            .unwrap_or(self.config.default_cooldown_seconds);
        if let Some(usage) = state.usage.get_mut(account_id) {
            if healthy {
                usage.cooldown_ends_at = None;
            } else {
                usage.cooldown_ends_at =
                    Some(now + chrono::Duration::seconds(cooldown_secs as i64));
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> AccountManagerStats {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let available = state
            .accounts
            .values()
            .filter(|a| {
                state
                    .usage
                    .get(&a.id)
                    .is_some_and(|u| self.account_available(a, u, now))
            })
            .count();
        let in_cooldown = state
            .usage
            .values()
            .filter(|u| u.cooldown_ends_at.is_some_and(|end| end > now))
            .count();
        AccountManagerStats {
            total_accounts: state.accounts.len(),
            available_accounts: available,
            active_checkouts: state.checkouts.len(),
            accounts_in_cooldown: in_cooldown,
            total_requests: state.usage.values().map(|u| u.request_count).sum(),
        }
    }

    /// Spawn the background sweep when auto-cleanup is on. Call once.
    pub fn start_sweeper(self: &Arc<Self>) {
        if !self.config.auto_cleanup {
            return;
        }
        let manager = Arc::clone(self);
        let token = self.sweeper.clone();
        let interval = std::time::Duration::from_secs(self.config.cleanup_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = manager.cleanup_expired_checkouts().await;
                        if swept > 0 {
                            info!(swept, "checkout sweep released expired slots");
                        }
                    }
                }
            }
        });
    }

    pub fn stop_sweeper(&self) {
        self.sweeper.cancel();
    }
}

impl Drop for AccountManager {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{ManualClock, system_clock};

    fn account(surface: &str, tenant: &str, name: &str) -> Account {
        Account::new(surface, tenant, format!("{name}@example.com"), name, Utc::now())
    }

    async fn manager_with_one_slot() -> (Arc<AccountManager>, String) {
        let manager = AccountManager::new(AccountManagerConfig::default(), system_clock());
        let mut acct = account("openai-api", "tenant-1", "primary");
        acct.max_concurrent = Some(1);
        let id = acct.id.clone();
        manager.add_account(acct).await.unwrap();
        (manager, id)
    }

    #[tokio::test]
    async fn checkout_respects_concurrency_cap() {
        let (manager, id) = manager_with_one_slot().await;
        let request = CheckoutRequest::new("openai-api", "tenant-1");

        let first = manager.checkout(request.clone()).await;
        assert!(first.is_some());
        assert!(manager.checkout(request.clone()).await.is_none());
        assert!(manager.checkout(request.clone()).await.is_none());

        assert!(manager.checkin(&first.unwrap().id, true).await);
        let usage = manager.get_usage(&id).await.unwrap();
        assert_eq!(usage.request_count, 1);
        assert_eq!(usage.success_count, 1);
        assert_eq!(usage.active_sessions, 0);

        let again = manager.checkout(request).await;
        assert!(again.is_some());
        assert_eq!(manager.get_usage(&id).await.unwrap().active_sessions, 1);
    }

    #[tokio::test]
    async fn selection_is_lru_with_nulls_first_and_id_tiebreak() {
        let clock = ManualClock::starting_at(Utc::now());
        let manager = AccountManager::new(
            AccountManagerConfig {
                cooldown_on_failure: false,
                default_max_concurrent: 5,
                ..AccountManagerConfig::default()
            },
            clock.clone(),
        );

        let mut ids: Vec<String> = Vec::new();
        for name in ["a", "b", "c"] {
            let acct = account("openai-api", "t", name);
            ids.push(acct.id.clone());
            manager.add_account(acct).await.unwrap();
        }
        ids.sort();

        // All never used: smallest id first.
        let request = CheckoutRequest::new("openai-api", "t");
        let first = manager.checkout(request.clone()).await.unwrap();
        assert_eq!(first.account_id, ids[0]);

        clock.advance_millis(1000);
        let second = manager.checkout(request.clone()).await.unwrap();
        assert_eq!(second.account_id, ids[1]);

        clock.advance_millis(1000);
        let third = manager.checkout(request.clone()).await.unwrap();
        assert_eq!(third.account_id, ids[2]);

        // Now the least recently used is ids[0] again.
        clock.advance_millis(1000);
        let fourth = manager.checkout(request).await.unwrap();
        assert_eq!(fourth.account_id, ids[0]);
    }

    #[tokio::test]
    async fn prefer_and_exclude_filters_apply() {
        let manager = AccountManager::new(AccountManagerConfig::default(), system_clock());
        let a = account("s", "t", "a");
        let b = account("s", "t", "b");
        let (id_a, id_b) = (a.id.clone(), b.id.clone());
        manager.add_account(a).await.unwrap();
        manager.add_account(b).await.unwrap();

        let mut request = CheckoutRequest::new("s", "t");
        request.prefer = vec![id_b.clone()];
        let checkout = manager.checkout(request).await.unwrap();
        assert_eq!(checkout.account_id, id_b);

        let mut request = CheckoutRequest::new("s", "t");
        request.exclude = vec![id_a.clone(), id_b.clone()];
        assert!(manager.checkout(request).await.is_none());
    }

    #[tokio::test]
    async fn failed_checkin_puts_account_in_cooldown() {
        let clock = ManualClock::starting_at(Utc::now());
        let manager = AccountManager::new(
            AccountManagerConfig {
                default_cooldown_seconds: 120,
                ..AccountManagerConfig::default()
            },
            clock.clone(),
        );
        let acct = account("s", "t", "only");
        let account_id = acct.id.clone();
        manager.add_account(acct).await.unwrap();

        let checkout = manager
            .checkout(CheckoutRequest::new("s", "t"))
            .await
            .unwrap();
        manager.checkin(&checkout.id, false).await;

        assert!(!manager.is_available(&account_id).await);
        assert!(manager.checkout(CheckoutRequest::new("s", "t")).await.is_none());

        clock.advance_millis(121_000);
        assert!(manager.is_available(&account_id).await);
    }

    #[tokio::test]
    async fn pool_membership_enforces_surface_match() {
        let manager = AccountManager::new(AccountManagerConfig::default(), system_clock());
        let openai = account("openai-api", "t", "oa");
        let google = account("google-serp", "t", "gg");
        let (openai_id, google_id) = (openai.id.clone(), google.id.clone());
        manager.add_account(openai).await.unwrap();
        manager.add_account(google).await.unwrap();

        let pool = manager.create_pool("premium", "openai-api").await;
        manager.add_to_pool(&pool.id, &openai_id).await.unwrap();
        let err = manager.add_to_pool(&pool.id, &google_id).await.unwrap_err();
        assert!(matches!(err, AccountError::SurfaceMismatch { .. }));

        // Checkout scoped to the pool only sees its members.
        let mut request = CheckoutRequest::new("openai-api", "t");
        request.pool_id = Some(pool.id.clone());
        let checkout = manager.checkout(request).await.unwrap();
        assert_eq!(checkout.account_id, openai_id);
    }

    #[tokio::test]
    async fn sweep_is_idempotent_and_races_safely_with_checkin() {
        let clock = ManualClock::starting_at(Utc::now());
        let manager = AccountManager::new(AccountManagerConfig::default(), clock.clone());
        let acct = account("s", "t", "x");
        let account_id = acct.id.clone();
        manager.add_account(acct).await.unwrap();

        let mut request = CheckoutRequest::new("s", "t");
        request.session_duration_secs = Some(10);
        let checkout = manager.checkout(request).await.unwrap();

        clock.advance_millis(11_000);
        assert_eq!(manager.cleanup_expired_checkouts().await, 1);
        assert_eq!(manager.cleanup_expired_checkouts().await, 0);
        assert_eq!(manager.get_usage(&account_id).await.unwrap().active_sessions, 0);

        // Checkin after the sweep is a no-op, not a double decrement.
        assert!(!manager.checkin(&checkout.id, true).await);
        assert_eq!(manager.get_usage(&account_id).await.unwrap().active_sessions, 0);
    }

    #[tokio::test]
    async fn session_duration_is_capped_by_config() {
        let clock = ManualClock::starting_at(Utc::now());
        let manager = AccountManager::new(
            AccountManagerConfig {
                max_checkout_duration_secs: 60,
                ..AccountManagerConfig::default()
            },
            clock.clone(),
        );
        manager.add_account(account("s", "t", "x")).await.unwrap();

        let mut request = CheckoutRequest::new("s", "t");
        request.session_duration_secs = Some(3600);
        let checkout = manager.checkout(request).await.unwrap();
        assert_eq!(
            checkout.expires_at - checkout.checked_out_at,
            chrono::Duration::seconds(60)
        );
    }

    #[tokio::test]
    async fn health_report_flips_status_and_cooldown() {
        let manager = AccountManager::new(AccountManagerConfig::default(), system_clock());
        let acct = account("s", "t", "x");
        let account_id = acct.id.clone();
        manager.add_account(acct).await.unwrap();

        manager
            .report_health_check(&account_id, false, None)
            .await
            .unwrap();
        let fetched = manager.get_account(&account_id).await.unwrap();
        assert_eq!(fetched.status, AccountStatus::Suspended);
        assert!(!manager.is_available(&account_id).await);

        manager
            .report_health_check(&account_id, true, None)
            .await
            .unwrap();
        let fetched = manager.get_account(&account_id).await.unwrap();
        assert_eq!(fetched.status, AccountStatus::Active);
        assert!(manager.is_available(&account_id).await);
    }

    #[tokio::test]
    async fn disabled_and_suspended_accounts_never_check_out() {
        let manager = AccountManager::new(AccountManagerConfig::default(), system_clock());
        let acct = account("s", "t", "x");
        let account_id = acct.id.clone();
        manager.add_account(acct).await.unwrap();

        manager.set_enabled(&account_id, false).await.unwrap();
        assert!(manager.checkout(CheckoutRequest::new("s", "t")).await.is_none());

        manager.set_enabled(&account_id, true).await.unwrap();
        manager
            .set_account_status(&account_id, AccountStatus::Invalid)
            .await
            .unwrap();
        assert!(manager.checkout(CheckoutRequest::new("s", "t")).await.is_none());
    }
}
