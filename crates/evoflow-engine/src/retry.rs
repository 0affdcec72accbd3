use std::time::Duration;

use evoflow_core::config::RetryConfig;

use crate::dag::RetryPolicy;

/// Retry settings for one node: the node's overrides layered on the global config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveRetry {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl EffectiveRetry {
    pub fn merge(global: &RetryConfig, node: Option<&RetryPolicy>) -> Self {
        let node = node.cloned().unwrap_or_default();
        Self {
            max_attempts: node.max_attempts.unwrap_or(global.max_attempts).max(1),
            initial_backoff_ms: node.initial_backoff_ms.unwrap_or(global.initial_backoff_ms),
            max_backoff_ms: node.max_backoff_ms.unwrap_or(global.max_backoff_ms),
            jitter: global.jitter,
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`: the base doubles each
    /// time and is capped, then optionally scaled by 0.8x to 1.2x.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_backoff_ms);
        if !self.jitter {
            return Duration::from_millis(ms);
        }
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((ms as f64 * jitter) as u64)
    }
}
