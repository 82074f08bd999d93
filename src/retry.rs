//! Pure retry policy: error classification gate + backoff calculation
//!
//! No clocks, no sleeping, no side effects. The orchestrator asks this module
//! whether a failed cell retries and how long to wait; scheduling the wait is
//! the caller's problem.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::error::ErrorCode;

/// Backoff curve applied between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Retry policy configuration, embedded in the manifest's execution block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Per-code overrides on top of the taxonomy defaults. Only the codes
    /// present here are overridden; everything else keeps its default flag.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub retry_conditions: HashMap<ErrorCode, bool>,
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            retry_conditions: HashMap::new(),
        }
    }
}

impl RetryConfig {
    /// Effective retryability of an error kind under this config.
    pub fn is_retryable(&self, kind: ErrorCode) -> bool {
        self.retry_conditions
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.is_retryable_default())
    }
}

/// Outcome of consulting the policy for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    Retry { delay_ms: u64 },
    /// The cell is done failing.
    GiveUp,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// True iff another attempt is allowed: the attempt budget has room and the
/// error kind is retryable under the config.
pub fn should_retry(kind: ErrorCode, attempt: u32, config: &RetryConfig) -> bool {
    attempt < config.max_retries && config.is_retryable(kind)
}

/// Backoff delay for the given zero-based attempt, capped at `max_delay_ms`.
///
/// With jitter enabled the capped delay is scaled by uniform(0.8, 1.2) drawn
/// from the injected RNG, so the result stays within 20% of the base value.
pub fn calculate_delay(attempt: u32, config: &RetryConfig, rng: &mut fastrand::Rng) -> u64 {
    let base = match config.backoff_strategy {
        BackoffStrategy::Fixed => config.initial_delay_ms as f64,
        BackoffStrategy::Linear => config.initial_delay_ms as f64 * (attempt as f64 + 1.0),
        BackoffStrategy::Exponential => {
            config.initial_delay_ms as f64 * config.backoff_multiplier.powi(attempt as i32)
        }
    };

    let capped = base.min(config.max_delay_ms as f64);

    if config.jitter {
        let factor = 0.8 + rng.f64() * 0.4;
        (capped * factor).round() as u64
    } else {
        capped.round() as u64
    }
}

/// Combined gate + delay in a single call.
pub fn evaluate(
    kind: ErrorCode,
    attempt: u32,
    config: &RetryConfig,
    rng: &mut fastrand::Rng,
) -> RetryDecision {
    if should_retry(kind, attempt, config) {
        RetryDecision::Retry {
            delay_ms: calculate_delay(attempt, config, rng),
        }
    } else {
        RetryDecision::GiveUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            backoff_strategy: strategy,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: false,
            retry_conditions: HashMap::new(),
        }
    }

    #[test]
    fn attempt_budget_gates_retry() {
        let config = no_jitter(BackoffStrategy::Exponential);
        assert!(should_retry(ErrorCode::NetworkError, 0, &config));
        assert!(should_retry(ErrorCode::NetworkError, 2, &config));
        assert!(!should_retry(ErrorCode::NetworkError, 3, &config));
        assert!(!should_retry(ErrorCode::NetworkError, 4, &config));
    }

    #[test]
    fn non_retryable_kinds_never_retry() {
        let config = no_jitter(BackoffStrategy::Exponential);
        for kind in [
            ErrorCode::AuthFailed,
            ErrorCode::QuotaExceeded,
            ErrorCode::InvalidRequest,
            ErrorCode::ContentBlocked,
            ErrorCode::CaptchaRequired,
        ] {
            assert!(!should_retry(kind, 0, &config), "{kind} must not retry");
        }
    }

    #[test]
    fn retry_conditions_override_defaults() {
        let mut config = no_jitter(BackoffStrategy::Fixed);
        config
            .retry_conditions
            .insert(ErrorCode::CaptchaRequired, true);
        config.retry_conditions.insert(ErrorCode::Timeout, false);

        assert!(should_retry(ErrorCode::CaptchaRequired, 0, &config));
        assert!(!should_retry(ErrorCode::Timeout, 0, &config));
    }

    #[test]
    fn fixed_strategy_is_flat() {
        let config = no_jitter(BackoffStrategy::Fixed);
        let mut rng = fastrand::Rng::with_seed(1);
        for attempt in 0..5 {
            assert_eq!(calculate_delay(attempt, &config, &mut rng), 100);
        }
    }

    #[test]
    fn linear_strategy_scales_with_attempt() {
        let config = no_jitter(BackoffStrategy::Linear);
        let mut rng = fastrand::Rng::with_seed(1);
        assert_eq!(calculate_delay(0, &config, &mut rng), 100);
        assert_eq!(calculate_delay(1, &config, &mut rng), 200);
        assert_eq!(calculate_delay(2, &config, &mut rng), 300);
    }

    #[test]
    fn exponential_strategy_doubles_and_caps() {
        let config = no_jitter(BackoffStrategy::Exponential);
        let mut rng = fastrand::Rng::with_seed(1);
        assert_eq!(calculate_delay(0, &config, &mut rng), 100);
        assert_eq!(calculate_delay(1, &config, &mut rng), 200);
        assert_eq!(calculate_delay(2, &config, &mut rng), 400);
        // 100 * 2^10 would be far past the cap
        assert_eq!(calculate_delay(10, &config, &mut rng), 10_000);
    }

    #[test]
    fn jitter_stays_in_band() {
        let mut config = no_jitter(BackoffStrategy::Fixed);
        config.jitter = true;
        let mut rng = fastrand::Rng::with_seed(42);
        for _ in 0..200 {
            let delay = calculate_delay(0, &config, &mut rng);
            assert!((80..=120).contains(&delay), "delay {delay} outside band");
        }
    }

    #[test]
    fn evaluate_combines_gate_and_delay() {
        let config = no_jitter(BackoffStrategy::Exponential);
        let mut rng = fastrand::Rng::with_seed(7);
        assert_eq!(
            evaluate(ErrorCode::NetworkError, 1, &config, &mut rng),
            RetryDecision::Retry { delay_ms: 200 }
        );
        assert_eq!(
            evaluate(ErrorCode::AuthFailed, 0, &config, &mut rng),
            RetryDecision::GiveUp
        );
    }
}
