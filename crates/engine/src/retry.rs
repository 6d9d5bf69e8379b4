// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry engine glue: jitter sampling and cooldown windows.
//!
//! The backoff arithmetic lives on `RetryPolicy` in fm-core so it stays
//! deterministic under test; this module supplies the random jitter sample
//! and the capacity-deferral cooldown.

use rand::Rng;
use std::time::Duration;

/// Cooldown before re-queueing a capacity-deferred task.
pub const CAPACITY_COOLDOWN: Duration = Duration::from_secs(5);

/// Sample from `U(-jitter_pct, +jitter_pct)`.
///
/// Without jitter, concurrent retries re-converge on the same instant and
/// recreate the pressure that failed them.
pub fn sample_jitter(jitter_pct: f64) -> f64 {
    if jitter_pct <= 0.0 {
        return 0.0;
    }
    rand::rng().random_range(-jitter_pct..=jitter_pct)
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
