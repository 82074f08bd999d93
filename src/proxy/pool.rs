//! Named proxy pools with rotation strategies
//!
//! A pool is a labeled set of registered proxies constrained to a list of
//! locations. `min_healthy_proxies` gates whether the pool serves at all.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::proxy::provider::ProxyError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastUsed,
    /// Pin each target to the first proxy it was served.
    Sticky,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPoolConfig {
    pub name: String,
    #[serde(default)]
    pub rotation_strategy: RotationStrategy,
    /// Locations this pool may serve; empty = any.
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default = "default_min_healthy")]
    pub min_healthy_proxies: usize,
}

fn default_min_healthy() -> usize {
    1
}

/// Mutable pool state; the manager serializes access.
#[derive(Debug)]
pub struct ProxyPool {
    pub id: String,
    pub config: ProxyPoolConfig,
    proxy_ids: Vec<String>,
    cursor: usize,
    use_counts: HashMap<String, u64>,
    sticky_assignments: HashMap<String, String>,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            proxy_ids: Vec::new(),
            cursor: 0,
            use_counts: HashMap::new(),
            sticky_assignments: HashMap::new(),
        }
    }

    pub fn add_proxy(&mut self, proxy_id: impl Into<String>) {
        let proxy_id = proxy_id.into();
        if !self.proxy_ids.contains(&proxy_id) {
            self.proxy_ids.push(proxy_id);
        }
    }

    pub fn remove_proxy(&mut self, proxy_id: &str) -> bool {
        let before = self.proxy_ids.len();
        self.proxy_ids.retain(|id| id != proxy_id);
        self.use_counts.remove(proxy_id);
        self.sticky_assignments.retain(|_, v| v != proxy_id);
        self.proxy_ids.len() != before
    }

    pub fn proxy_ids(&self) -> &[String] {
        &self.proxy_ids
    }

    pub fn serves_location(&self, location_id: &str) -> bool {
        self.config.locations.is_empty()
            || self.config.locations.iter().any(|l| l == location_id)
    }

    /// Pick a proxy among healthy members, honoring the rotation strategy.
    /// `healthy` is the manager's view of which members are usable.
    pub fn select(
        &mut self,
        healthy: &dyn Fn(&str) -> bool,
        exclude: &[String],
        target: Option<&str>,
        rng: &mut fastrand::Rng,
    ) -> Result<String, ProxyError> {
        let usable: Vec<String> = self
            .proxy_ids
            .iter()
            .filter(|id| healthy(id) && !exclude.contains(*id))
            .cloned()
            .collect();

        // Guard emptiness on its own: `min_healthy_proxies` may legally be 0
        // (no gate), and every strategy below indexes into `usable`.
        if usable.is_empty() || usable.len() < self.config.min_healthy_proxies {
            return Err(ProxyError::PoolUnhealthy(self.config.name.clone()));
        }

        let picked = match self.config.rotation_strategy {
            RotationStrategy::RoundRobin => {
                let pick = usable[self.cursor % usable.len()].clone();
                self.cursor = self.cursor.wrapping_add(1);
                pick
            }
            RotationStrategy::Random => usable[rng.usize(..usable.len())].clone(),
            RotationStrategy::LeastUsed => usable
                .iter()
                .min_by_key(|id| self.use_counts.get(*id).copied().unwrap_or(0))
                .cloned()
                .expect("usable is non-empty"),
            RotationStrategy::Sticky => {
                let key = target.unwrap_or("*").to_string();
                match self.sticky_assignments.get(&key) {
                    Some(existing) if usable.contains(existing) => existing.clone(),
                    _ => {
                        let pick = usable[self.cursor % usable.len()].clone();
                        self.cursor = self.cursor.wrapping_add(1);
                        self.sticky_assignments.insert(key, pick.clone());
                        pick
                    }
                }
            }
        };

        *self.use_counts.entry(picked.clone()).or_insert(0) += 1;
        Ok(picked)
    }
}
