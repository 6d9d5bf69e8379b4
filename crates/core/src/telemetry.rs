// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide telemetry: atomic counters plus fixed-bucket histograms.
//!
//! Snapshot-able for the status surface; counters are monotonic.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bucket bounds in milliseconds.
const BUCKET_BOUNDS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1_000, 5_000, 30_000];

/// Fixed-bucket latency histogram.
#[derive(Default)]
pub struct Histogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl Histogram {
    pub fn record_ms(&self, value_ms: u64) {
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| value_ms <= bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum_ms: u64,
}

/// Counters and histograms exported by the core.
#[derive(Default)]
pub struct Telemetry {
    pub tasks_submitted: AtomicU64,
    pub tasks_admitted: AtomicU64,
    pub tasks_succeeded: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_timed_out: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub attempts: AtomicU64,
    pub breaker_transitions: AtomicU64,
    pub budget_alerts: AtomicU64,
    /// Rejections keyed by error kind tag
    rejected: Mutex<HashMap<String, u64>>,
    /// Bus drops keyed by reason
    events_dropped: Mutex<HashMap<String, u64>>,

    pub admission_to_dispatch: Histogram,
    pub dispatch_to_start: Histogram,
    pub attempt_duration: Histogram,
    pub end_to_end: Histogram,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_rejected(&self, reason: &str) {
        *self.rejected.lock().entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn incr_dropped(&self, reason: &str) {
        *self.events_dropped.lock().entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn rejected_count(&self, reason: &str) -> u64 {
        self.rejected.lock().get(reason).copied().unwrap_or(0)
    }

    pub fn dropped_count(&self, reason: &str) -> u64 {
        self.events_dropped.lock().get(reason).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_admitted: self.tasks_admitted.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            breaker_transitions: self.breaker_transitions.load(Ordering::Relaxed),
            budget_alerts: self.budget_alerts.load(Ordering::Relaxed),
            tasks_rejected: self.rejected.lock().clone(),
            events_dropped: self.events_dropped.lock().clone(),
            admission_to_dispatch: self.admission_to_dispatch.snapshot(),
            dispatch_to_start: self.dispatch_to_start.snapshot(),
            attempt_duration: self.attempt_duration.snapshot(),
            end_to_end: self.end_to_end.snapshot(),
        }
    }
}

/// Serializable point-in-time view of [`Telemetry`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub tasks_submitted: u64,
    pub tasks_admitted: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub tasks_cancelled: u64,
    pub attempts: u64,
    pub breaker_transitions: u64,
    pub budget_alerts: u64,
    #[serde(default)]
    pub tasks_rejected: HashMap<String, u64>,
    #[serde(default)]
    pub events_dropped: HashMap<String, u64>,
    #[serde(default)]
    pub admission_to_dispatch: HistogramSnapshot,
    #[serde(default)]
    pub dispatch_to_start: HistogramSnapshot,
    #[serde(default)]
    pub attempt_duration: HistogramSnapshot,
    #[serde(default)]
    pub end_to_end: HistogramSnapshot,
}

#[cfg(test)]
#[path = "telemetry_tests.rs"]
mod tests;
