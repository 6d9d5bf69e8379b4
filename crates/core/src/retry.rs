// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-task retry policy and backoff arithmetic.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff growth curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

crate::simple_display! {
    Backoff {
        Fixed => "fixed",
        Linear => "linear",
        Exponential => "exponential",
    }
}

/// Retry policy carried by every task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
    /// Jitter amplitude as a fraction of the computed delay, in [0, 1]
    pub jitter_pct: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
            backoff: Backoff::Exponential,
            jitter_pct: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based; the first attempt has no delay).
    ///
    /// `jitter` is a sample from `U(-jitter_pct, +jitter_pct)`, supplied by
    /// the caller so the arithmetic stays deterministic under test.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let step = attempt - 1;
        let factor = match self.backoff {
            Backoff::Fixed => 1.0,
            Backoff::Linear => f64::from(step),
            Backoff::Exponential => 2f64.powi(step.saturating_sub(1) as i32),
        };
        let raw = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        let jittered = raw * (1.0 + jitter.clamp(-self.jitter_pct, self.jitter_pct));
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts_so_far`.
    pub fn allows_attempt(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
