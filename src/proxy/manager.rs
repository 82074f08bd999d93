//! Proxy manager - provider resolution, sticky sessions, health, pools
//!
//! Locations resolve to providers ('auto' = highest-priority enabled
//! provider supporting the location). Sticky sessions are keyed by
//! `(proxy_id, target)` and reused while unexpired. A background ticker
//! probes registered proxies against a lightweight endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::proxy::{ProxyConfig, ProxyHealth, ProxySession, ProxyType};
use crate::proxy::health::{HealthTracker, HealthTrackerConfig};
use crate::proxy::pool::{ProxyPool, ProxyPoolConfig};
use crate::proxy::provider::{ProxyError, ProxyProvider, ProxyRequestOptions};
use crate::utils::SharedClock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyManagerConfig {
    /// Default sticky session TTL, seconds.
    #[serde(default = "default_sticky_duration")]
    pub default_sticky_duration_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_ms: u64,
    #[serde(default = "default_health_url")]
    pub health_check_url: String,
    #[serde(default)]
    pub health: HealthTrackerConfig,
}

fn default_sticky_duration() -> u64 {
    600
}
fn default_health_interval() -> u64 {
    300
}
fn default_health_timeout() -> u64 {
    5000
}
fn default_health_url() -> String {
    "https://www.gstatic.com/generate_204".to_string()
}

impl Default for ProxyManagerConfig {
    fn default() -> Self {
        Self {
            default_sticky_duration_secs: default_sticky_duration(),
            health_check_interval_secs: default_health_interval(),
            health_check_timeout_ms: default_health_timeout(),
            health_check_url: default_health_url(),
            health: HealthTrackerConfig::default(),
        }
    }
}

/// A proxy request from the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    pub location: Option<String>,
    pub proxy_type: Option<ProxyType>,
    /// Provider hint from the manifest; `None` or `"auto"` selects by priority.
    pub provider: Option<String>,
    pub session_id: Option<String>,
    pub target: Option<String>,
    pub pool_id: Option<String>,
    pub exclude: Vec<String>,
    pub require_sticky: bool,
    pub session_duration_minutes: Option<u32>,
}

/// A granted proxy plus the sticky session token to attach, if any.
#[derive(Debug, Clone)]
pub struct ProxyLease {
    pub proxy: ProxyConfig,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyManagerStats {
    pub providers: usize,
    pub registered_proxies: usize,
    pub pools: usize,
    pub active_sessions: usize,
    pub unhealthy_proxies: usize,
}

struct ProviderEntry {
    provider: Arc<dyn ProxyProvider>,
    priority: u32,
    enabled: bool,
}

#[derive(Default)]
struct ManagerState {
    providers: Vec<ProviderEntry>,
    /// Statically registered proxies, addressable by pools and probes.
    registered: HashMap<String, ProxyConfig>,
    pools: HashMap<String, ProxyPool>,
    /// Sticky sessions keyed `(proxy_id, target)`.
    sessions: HashMap<(String, String), Arc<ProxySession>>,
    rng: fastrand::Rng,
}

pub struct ProxyManager {
    config: ProxyManagerConfig,
    clock: SharedClock,
    state: Mutex<ManagerState>,
    health: Mutex<HealthTracker>,
    probe_token: CancellationToken,
}

impl std::fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProxyManager {
    pub fn new(config: ProxyManagerConfig, clock: SharedClock) -> Arc<Self> {
        let health = HealthTracker::new(config.health.clone());
        Arc::new(Self {
            config,
            clock,
            state: Mutex::new(ManagerState {
                rng: fastrand::Rng::with_seed(fastrand::u64(..)),
                ..ManagerState::default()
            }),
            health: Mutex::new(health),
            probe_token: CancellationToken::new(),
        })
    }

    // === Providers ===

    pub async fn register_provider(&self, provider: Arc<dyn ProxyProvider>, priority: u32) {
        info!(provider = provider.id(), priority, "proxy provider registered");
        let mut state = self.state.lock().await;
        state.providers.push(ProviderEntry {
            provider,
            priority,
            enabled: true,
        });
        state.providers.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub async fn set_provider_enabled(&self, provider_id: &str, enabled: bool) {
        let mut state = self.state.lock().await;
        for entry in &mut state.providers {
            if entry.provider.id() == provider_id {
                entry.enabled = enabled;
            }
        }
    }

    // === Registered proxies & pools ===

    pub async fn register_proxy(&self, proxy: ProxyConfig) {
        self.state
            .lock()
            .await
            .registered
            .insert(proxy.id.clone(), proxy);
    }

    pub async fn create_pool(&self, config: ProxyPoolConfig, proxy_ids: Vec<String>) -> String {
        let mut pool = ProxyPool::new(config);
        for id in proxy_ids {
            pool.add_proxy(id);
        }
        let pool_id = pool.id.clone();
        self.state.lock().await.pools.insert(pool_id.clone(), pool);
        pool_id
    }

    pub async fn remove_pool(&self, pool_id: &str) -> bool {
        self.state.lock().await.pools.remove(pool_id).is_some()
    }

    // === Request path ===

    /// Resolve a proxy for the request, creating or reusing a sticky session
    /// when asked to.
    pub async fn request_proxy(&self, request: ProxyRequest) -> Result<ProxyLease, ProxyError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        // Expire stale sessions opportunistically.
        state.sessions.retain(|_, s| !s.is_expired(now));

        // Sticky reuse: an unexpired session for this target wins.
        if request.require_sticky {
            if let Some(target) = &request.target {
                let reusable = state
                    .sessions
                    .iter()
                    .find(|((_, t), session)| {
                        t == target
                            && !session.is_expired(now)
                            && !request.exclude.contains(&session.proxy_id)
                    })
                    .map(|(_, session)| Arc::clone(session));
                if let Some(session) = reusable {
                    if let Some(proxy) = state.registered.get(&session.proxy_id).cloned() {
                        session.record_request();
                        debug!(proxy_id = %proxy.id, target, "sticky session reused");
                        return Ok(ProxyLease {
                            proxy,
                            session_id: Some(session.id.clone()),
                        });
                    }
                }
            }
        }

        let proxy = if let Some(pool_id) = &request.pool_id {
            let health = self.health.lock().await;
            let usable = |id: &str| health.is_usable(id);
            let pool = state
                .pools
                .get(pool_id)
                .ok_or_else(|| ProxyError::PoolNotFound(pool_id.clone()))?;
            if let Some(location) = &request.location {
                if !pool.serves_location(location) {
                    return Err(ProxyError::NoProxyAvailable(location.clone()));
                }
            }
            // Split borrow: selection needs &mut pool, registry lookup after.
            let target = request.target.as_deref();
            let exclude = request.exclude.clone();
            let mut rng = fastrand::Rng::with_seed(state.rng.u64(..));
            let picked = state
                .pools
                .get_mut(pool_id)
                .expect("checked above")
                .select(&usable, &exclude, target, &mut rng)?;
            state
                .registered
                .get(&picked)
                .cloned()
                .ok_or_else(|| ProxyError::NoProxyAvailable(picked))?
        } else {
            let location = request
                .location
                .clone()
                .ok_or_else(|| ProxyError::NoProviderForLocation("<none>".to_string()))?;
            self.resolve_via_provider(&mut state, &location, &request, now)
                .await?
        };

        let session_id = if request.require_sticky {
            let target = request.target.clone().unwrap_or_else(|| "*".to_string());
            let ttl = request
                .session_duration_minutes
                .map(|m| u64::from(m) * 60)
                .unwrap_or(self.config.default_sticky_duration_secs);
            let session = ProxySession::new(proxy.id.clone(), target.clone(), now, ttl);
            session.record_request();
            let id = session.id.clone();
            state
                .sessions
                .insert((proxy.id.clone(), target), session);
            Some(id)
        } else {
            None
        };

        Ok(ProxyLease { proxy, session_id })
    }

    async fn resolve_via_provider(
        &self,
        state: &mut ManagerState,
        location: &str,
        request: &ProxyRequest,
        _now: chrono::DateTime<chrono::Utc>,
    ) -> Result<ProxyConfig, ProxyError> {
        let wants_named = request
            .provider
            .as_deref()
            .filter(|p| !p.is_empty() && *p != "auto");

        let provider = state
            .providers
            .iter()
            .filter(|e| e.enabled)
            .filter(|e| wants_named.is_none_or(|name| e.provider.id() == name))
            .find(|e| e.provider.supports_location(location))
            .map(|e| Arc::clone(&e.provider))
            .ok_or_else(|| ProxyError::NoProviderForLocation(location.to_string()))?;

        let options = ProxyRequestOptions {
            proxy_type: request.proxy_type,
            session_duration_minutes: request.session_duration_minutes,
            session_id: request.session_id.clone(),
        };

        // A provider may serve rotating identities; skip ones we know are
        // unhealthy or excluded, within a small attempt budget.
        let health = self.health.lock().await;
        for _ in 0..3 {
            let proxy = provider.get_proxy_config(location, &options).await?;
            if request.exclude.contains(&proxy.id) || !health.is_usable(&proxy.id) {
                continue;
            }
            // Make the identity addressable for probes and result reports.
            state.registered.entry(proxy.id.clone()).or_insert_with(|| proxy.clone());
            return Ok(proxy);
        }
        Err(ProxyError::NoProxyAvailable(location.to_string()))
    }

    // === Health ===

    /// Usage callback from the orchestrator after each job.
    pub async fn report_result(
        &self,
        proxy_id: &str,
        success: bool,
        latency_ms: Option<u64>,
        error: Option<String>,
    ) {
        let now = self.clock.now();
        self.health
            .lock()
            .await
            .record(proxy_id, success, latency_ms, error, now);
    }

    pub async fn proxy_health(&self, proxy_id: &str) -> Option<ProxyHealth> {
        self.health.lock().await.health(proxy_id).cloned()
    }

    /// Probe one proxy against the lightweight endpoint.
    async fn probe(&self, proxy: &ProxyConfig) {
        let started = std::time::Instant::now();
        let outcome = async {
            let endpoint: url::Url = self
                .config
                .health_check_url
                .parse()
                .map_err(|e| format!("bad health check url: {e}"))?;
            let client = reqwest::Client::builder()
                .proxy(
                    reqwest::Proxy::all(proxy.url())
                        .map_err(|e| format!("bad proxy url: {e}"))?,
                )
                .timeout(std::time::Duration::from_millis(
                    self.config.health_check_timeout_ms,
                ))
                .build()
                .map_err(|e| format!("client build failed: {e}"))?;
            let response = client
                .get(endpoint)
                .send()
                .await
                .map_err(|e| format!("probe failed: {e}"))?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(format!("probe status {}", response.status()))
            }
        }
        .await;

        let latency = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => self.report_result(&proxy.id, true, Some(latency), None).await,
            Err(message) => {
                self.report_result(&proxy.id, false, None, Some(message))
                    .await
            }
        }
    }

    /// Background ticker actively probing every registered proxy.
    pub fn start_health_monitor(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let token = self.probe_token.clone();
        let interval = std::time::Duration::from_secs(self.config.health_check_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let proxies: Vec<ProxyConfig> = {
                            let state = manager.state.lock().await;
                            state.registered.values().filter(|p| p.enabled).cloned().collect()
                        };
                        debug!(count = proxies.len(), "probing registered proxies");
                        futures::future::join_all(
                            proxies.iter().map(|proxy| manager.probe(proxy)),
                        )
                        .await;
                    }
                }
            }
        });
    }

    pub fn stop_health_monitor(&self) {
        self.probe_token.cancel();
    }

    /// Drop expired sticky sessions; returns how many were removed.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, s| !s.is_expired(now));
        let removed = before - state.sessions.len();
        if removed > 0 {
            debug!(removed, "expired sticky sessions dropped");
        }
        removed
    }

    pub async fn stats(&self) -> ProxyManagerStats {
        let state = self.state.lock().await;
        let health = self.health.lock().await;
        let unhealthy = state
            .registered
            .keys()
            .filter(|id| !health.is_usable(id))
            .count();
        ProxyManagerStats {
            providers: state.providers.len(),
            registered_proxies: state.registered.len(),
            pools: state.pools.len(),
            active_sessions: state.sessions.len(),
            unhealthy_proxies: unhealthy,
        }
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        self.probe_token.cancel();
    }
}
