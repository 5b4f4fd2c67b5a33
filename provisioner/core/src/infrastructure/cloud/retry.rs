// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Exponential backoff with full jitter for throttled cloud calls

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the sleep after failed attempt `attempt` (0-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Uniform in `[0, ceiling(attempt)]`
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = self.ceiling(attempt).as_millis() as u64;
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=cap))
    }
}
