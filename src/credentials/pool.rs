//! Per-surface credential pool with selection strategies and cooldowns
//!
//! The pool owns weak references (credential ids) plus usage counters; the
//! vault keeps the payloads. Selection never returns a credential that is in
//! cooldown. Observers subscribe to pool events; emission is synchronous and
//! in registration order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::SharedClock;

/// How `get_next` picks among available credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastUsed,
}

/// Aggregate pool health derived from available credential count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPoolConfig {
    #[serde(default)]
    pub strategy: SelectionStrategy,
    /// Consecutive errors before a credential enters cooldown.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    #[serde(default = "default_error_cooldown_ms")]
    pub error_cooldown_ms: u64,
    /// Minimum available credentials for the pool to count as healthy.
    #[serde(default = "default_min_active")]
    pub min_active_credentials: usize,
}

fn default_max_errors() -> u32 {
    3
}
fn default_error_cooldown_ms() -> u64 {
    60_000
}
fn default_min_active() -> usize {
    1
}

impl Default for CredentialPoolConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::RoundRobin,
            max_errors: default_max_errors(),
            error_cooldown_ms: default_error_cooldown_ms(),
            min_active_credentials: default_min_active(),
        }
    }
}

/// Events observers receive from a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    CredentialUsed {
        credential_id: String,
        success: bool,
    },
    CredentialCooldownStart {
        credential_id: String,
        until: DateTime<Utc>,
    },
    CredentialCooldownEnd {
        credential_id: String,
    },
    PoolExhausted {
        surface_id: String,
    },
    PoolHealthChange {
        surface_id: String,
        from: PoolHealth,
        to: PoolHealth,
    },
}

/// Per-credential usage bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialUsage {
    pub credential_id: String,
    pub use_count: u64,
    /// Consecutive errors; reset on any success.
    pub error_count: u32,
    pub in_cooldown: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Entry {
    usage: CredentialUsage,
}

#[derive(Debug)]
struct PoolState {
    /// Insertion order; round-robin and tie-breaks depend on it.
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    rr_cursor: usize,
    health: PoolHealth,
    rng: fastrand::Rng,
}

type Subscriber = Box<dyn Fn(&PoolEvent) + Send + Sync>;

/// Credential pool bound to a single surface.
pub struct CredentialPool {
    surface_id: String,
    config: CredentialPoolConfig,
    clock: SharedClock,
    state: std::sync::Mutex<PoolState>,
    subscribers: std::sync::Mutex<Vec<Subscriber>>,
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("surface_id", &self.surface_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Snapshot for operational introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub surface_id: String,
    pub total_credentials: usize,
    pub available_credentials: usize,
    pub in_cooldown: usize,
    pub health: PoolHealth,
    pub usage: Vec<CredentialUsage>,
}

impl CredentialPool {
    pub fn new(
        surface_id: impl Into<String>,
        config: CredentialPoolConfig,
        clock: SharedClock,
    ) -> Self {
        Self::with_seed(surface_id, config, clock, fastrand::u64(..))
    }

    /// Deterministic RNG for the random strategy under test.
    pub fn with_seed(
        surface_id: impl Into<String>,
        config: CredentialPoolConfig,
        clock: SharedClock,
        seed: u64,
    ) -> Self {
        Self {
            surface_id: surface_id.into(),
            config,
            clock,
            state: std::sync::Mutex::new(PoolState {
                order: Vec::new(),
                entries: HashMap::new(),
                rr_cursor: 0,
                health: PoolHealth::Unhealthy,
                rng: fastrand::Rng::with_seed(seed),
            }),
            subscribers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn surface_id(&self) -> &str {
        &self.surface_id
    }

    /// Register an observer. Callbacks run synchronously on the calling task.
    pub fn subscribe(&self, callback: impl Fn(&PoolEvent) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(Box::new(callback));
    }

    fn emit(&self, event: PoolEvent) {
        let subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        for subscriber in subscribers.iter() {
            subscriber(&event);
        }
    }

    /// Add a credential id; re-adding an existing id is a no-op.
    pub fn add_credential(&self, credential_id: impl Into<String>) {
        let credential_id = credential_id.into();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            if state.entries.contains_key(&credential_id) {
                return;
            }
            state.order.push(credential_id.clone());
            state.entries.insert(
                credential_id.clone(),
                Entry {
                    usage: CredentialUsage {
                        credential_id,
                        use_count: 0,
                        error_count: 0,
                        in_cooldown: false,
                        cooldown_until: None,
                    },
                },
            );
            self.refresh_health(&mut state, &mut events);
        }
        for event in events {
            self.emit(event);
        }
    }

    pub fn remove_credential(&self, credential_id: &str) -> bool {
        let mut events = Vec::new();
        let removed = {
            let mut state = self.state.lock().expect("pool lock poisoned");
            let removed = state.entries.remove(credential_id).is_some();
            if removed {
                state.order.retain(|id| id != credential_id);
                if state.rr_cursor >= state.order.len() {
                    state.rr_cursor = 0;
                }
                self.refresh_health(&mut state, &mut events);
            }
            removed
        };
        for event in events {
            self.emit(event);
        }
        removed
    }

    pub fn credential_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("pool lock poisoned")
            .order
            .clone()
    }

    /// Pick the next credential per the configured strategy, or `None` when
    /// every credential is cooling down (emits `pool_exhausted`).
    pub fn get_next(&self) -> Option<String> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let picked = {
            let mut state = self.state.lock().expect("pool lock poisoned");
            self.end_elapsed_cooldowns(&mut state, now, &mut events);

            let available: Vec<String> = state
                .order
                .iter()
                .filter(|id| {
                    state
                        .entries
                        .get(*id)
                        .is_some_and(|e| !e.usage.in_cooldown)
                })
                .cloned()
                .collect();

            if available.is_empty() {
                events.push(PoolEvent::PoolExhausted {
                    surface_id: self.surface_id.clone(),
                });
                None
            } else {
                let picked = match self.config.strategy {
                    SelectionStrategy::RoundRobin => {
                        let cursor = state.rr_cursor % available.len();
                        state.rr_cursor = state.rr_cursor.wrapping_add(1);
                        available[cursor].clone()
                    }
                    SelectionStrategy::Random => {
                        let idx = state.rng.usize(..available.len());
                        available[idx].clone()
                    }
                    SelectionStrategy::LeastUsed => {
                        // Ties broken by insertion order (available preserves it).
                        available
                            .iter()
                            .min_by_key(|id| state.entries[*id].usage.use_count)
                            .cloned()
                            .expect("available is non-empty")
                    }
                };
                if let Some(entry) = state.entries.get_mut(&picked) {
                    entry.usage.use_count += 1;
                }
                Some(picked)
            }
        };
        for event in events {
            self.emit(event);
        }
        picked
    }

    /// Report the outcome of using a credential. A success clears the error
    /// streak; `max_errors` consecutive failures start a cooldown.
    pub fn report_result(&self, credential_id: &str, success: bool) {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            let Some(entry) = state.entries.get_mut(credential_id) else {
                warn!(
                    surface_id = %self.surface_id,
                    credential_id,
                    "result reported for unknown credential"
                );
                return;
            };

            events.push(PoolEvent::CredentialUsed {
                credential_id: credential_id.to_string(),
                success,
            });

            if success {
                entry.usage.error_count = 0;
            } else {
                entry.usage.error_count += 1;
                if entry.usage.error_count >= self.config.max_errors && !entry.usage.in_cooldown {
                    let until =
                        now + chrono::Duration::milliseconds(self.config.error_cooldown_ms as i64);
                    entry.usage.in_cooldown = true;
                    entry.usage.cooldown_until = Some(until);
                    debug!(
                        surface_id = %self.surface_id,
                        credential_id,
                        until = %until,
                        "credential entered cooldown"
                    );
                    events.push(PoolEvent::CredentialCooldownStart {
                        credential_id: credential_id.to_string(),
                        until,
                    });
                }
            }
            self.refresh_health(&mut state, &mut events);
        }
        for event in events {
            self.emit(event);
        }
    }

    pub fn health(&self) -> PoolHealth {
        self.state.lock().expect("pool lock poisoned").health
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().expect("pool lock poisoned");
        let usage: Vec<CredentialUsage> = state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id).map(|e| e.usage.clone()))
            .collect();
        let in_cooldown = usage.iter().filter(|u| u.in_cooldown).count();
        PoolStats {
            surface_id: self.surface_id.clone(),
            total_credentials: usage.len(),
            available_credentials: usage.len() - in_cooldown,
            in_cooldown,
            health: state.health,
            usage,
        }
    }

    fn end_elapsed_cooldowns(
        &self,
        state: &mut PoolState,
        now: DateTime<Utc>,
        events: &mut Vec<PoolEvent>,
    ) {
        for id in state.order.clone() {
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if entry.usage.in_cooldown
                && entry.usage.cooldown_until.is_some_and(|until| until <= now)
            {
                entry.usage.in_cooldown = false;
                entry.usage.cooldown_until = None;
                entry.usage.error_count = 0;
                events.push(PoolEvent::CredentialCooldownEnd {
                    credential_id: id.clone(),
                });
            }
        }
        self.refresh_health(state, events);
    }

    fn refresh_health(&self, state: &mut PoolState, events: &mut Vec<PoolEvent>) {
        let available = state
            .entries
            .values()
            .filter(|e| !e.usage.in_cooldown)
            .count();
        let next = if available >= self.config.min_active_credentials {
            PoolHealth::Healthy
        } else if available > 0 {
            PoolHealth::Degraded
        } else {
            PoolHealth::Unhealthy
        };
        if next != state.health {
            events.push(PoolEvent::PoolHealthChange {
                surface_id: self.surface_id.clone(),
                from: state.health,
                to: next,
            });
            state.health = next;
        }
    }
}
