//! Exponential backoff for transient stage failures.

use std::time::Duration;

use crate::config::WorkflowConfig;

/// Retry schedule for a single stage.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: config.backoff_base,
            multiplier: config.backoff_multiplier.max(1),
        }
    }

    /// Delay before retry number `retry` (1-based), or `None` once the cap is reached.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let factor = self.multiplier.saturating_pow(retry - 1);
        Some(self.base.saturating_mul(factor))
    }

    /// Total attempts including the first call.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkflowConfig::default())
    }
}
