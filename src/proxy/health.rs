//! Proxy health tracking
//!
//! Success rate is an exponential moving average; status flips to unhealthy
//! after a run of consecutive failures and recovers after a run of
//! consecutive successes. Pure bookkeeping - probing lives in the manager.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::proxy::{ProxyHealth, ProxyHealthStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthTrackerConfig {
    /// Weight of the newest observation in the moving average.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Consecutive failures before a proxy is marked unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Consecutive successes before an unhealthy proxy is restored.
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    /// Success rate below which a working proxy counts as degraded.
    #[serde(default = "default_degraded_rate")]
    pub degraded_success_rate: f64,
}

fn default_ema_alpha() -> f64 {
    0.2
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_recovery_threshold() -> u32 {
    2
}
fn default_degraded_rate() -> f64 {
    0.7
}

impl Default for HealthTrackerConfig {
    fn default() -> Self {
        Self {
            ema_alpha: default_ema_alpha(),
            unhealthy_threshold: default_unhealthy_threshold(),
            recovery_threshold: default_recovery_threshold(),
            degraded_success_rate: default_degraded_rate(),
        }
    }
}

/// Rolling health state per proxy id.
#[derive(Debug)]
pub struct HealthTracker {
    config: HealthTrackerConfig,
    records: HashMap<String, ProxyHealth>,
}

impl HealthTracker {
    pub fn new(config: HealthTrackerConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    /// Record one usage or probe outcome.
    pub fn record(
        &mut self,
        proxy_id: &str,
        success: bool,
        latency_ms: Option<u64>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> ProxyHealthStatus {
        let health = self
            .records
            .entry(proxy_id.to_string())
            .or_insert_with(|| ProxyHealth::unknown(now));

        health.total_requests += 1;
        let sample = if success { 1.0 } else { 0.0 };
        health.success_rate = if health.total_requests == 1 {
            sample
        } else {
            self.config.ema_alpha * sample + (1.0 - self.config.ema_alpha) * health.success_rate
        };
        health.last_checked = now;

        if success {
            health.consecutive_successes += 1;
            health.consecutive_failures = 0;
            if let Some(latency) = latency_ms {
                health.latency_ms = Some(latency);
            }
        } else {
            health.failed_requests += 1;
            health.consecutive_failures += 1;
            health.consecutive_successes = 0;
            health.last_error = error;
        }

        let previous = health.status;
        health.status = match previous {
            ProxyHealthStatus::Unhealthy => {
                if health.consecutive_successes >= self.config.recovery_threshold {
                    ProxyHealthStatus::Healthy
                } else {
                    ProxyHealthStatus::Unhealthy
                }
            }
            _ => {
                if health.consecutive_failures >= self.config.unhealthy_threshold {
                    ProxyHealthStatus::Unhealthy
                } else if health.success_rate < self.config.degraded_success_rate
                    && health.total_requests > 1
                {
                    ProxyHealthStatus::Degraded
                } else {
                    ProxyHealthStatus::Healthy
                }
            }
        };

        if previous != health.status {
            match health.status {
                ProxyHealthStatus::Unhealthy => {
                    info!(proxy_id, rate = health.success_rate, "proxy marked unhealthy");
                }
                ProxyHealthStatus::Healthy => {
                    info!(proxy_id, "proxy restored to healthy");
                }
                _ => debug!(proxy_id, status = ?health.status, "proxy health changed"),
            }
        }
        health.status
    }

    pub fn status(&self, proxy_id: &str) -> ProxyHealthStatus {
        self.records
            .get(proxy_id)
            .map_or(ProxyHealthStatus::Unknown, |h| h.status)
    }

    pub fn is_usable(&self, proxy_id: &str) -> bool {
        self.status(proxy_id) != ProxyHealthStatus::Unhealthy
    }

    pub fn health(&self, proxy_id: &str) -> Option<&ProxyHealth> {
        self.records.get(proxy_id)
    }

    pub fn snapshot(&self) -> HashMap<String, ProxyHealth> {
        self.records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthTrackerConfig {
            ema_alpha: 0.5,
            unhealthy_threshold: 3,
            recovery_threshold: 2,
            degraded_success_rate: 0.7,
        })
    }

    #[test]
    fn consecutive_failures_flip_unhealthy() {
        let mut tracker = tracker();
        let now = Utc::now();
        tracker.record("p", false, None, Some("timeout".to_string()), now);
        tracker.record("p", false, None, None, now);
        assert_ne!(tracker.status("p"), ProxyHealthStatus::Unhealthy);
        tracker.record("p", false, None, None, now);
        assert_eq!(tracker.status("p"), ProxyHealthStatus::Unhealthy);
        assert!(!tracker.is_usable("p"));
    }

    #[test]
    fn recovery_needs_consecutive_successes() {
        let mut tracker = tracker();
        let now = Utc::now();
        for _ in 0..3 {
            tracker.record("p", false, None, None, now);
        }
        tracker.record("p", true, Some(80), None, now);
        assert_eq!(tracker.status("p"), ProxyHealthStatus::Unhealthy);
        tracker.record("p", true, Some(90), None, now);
        assert_eq!(tracker.status("p"), ProxyHealthStatus::Healthy);
        assert_eq!(tracker.health("p").unwrap().latency_ms, Some(90));
    }

    #[test]
    fn interleaved_failures_degrade_via_ema() {
        let mut tracker = tracker();
        let now = Utc::now();
        tracker.record("p", true, None, None, now);
        tracker.record("p", false, None, None, now);
        // rate = 0.5 < 0.7 but no failure streak of 3
        assert_eq!(tracker.status("p"), ProxyHealthStatus::Degraded);
        assert!(tracker.is_usable("p"));
    }

    #[test]
    fn unknown_proxy_is_usable() {
        let tracker = tracker();
        assert_eq!(tracker.status("never-seen"), ProxyHealthStatus::Unknown);
        assert!(tracker.is_usable("never-seen"));
    }
}
