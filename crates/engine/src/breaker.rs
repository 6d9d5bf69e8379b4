// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-key circuit breakers guarding provider calls.
//!
//! Two key shapes are tracked and both consulted: `(kind, instance)` for
//! per-worker isolation and `(kind)` for provider-wide isolation. The
//! provider-wide key opens only once failures were observed on at least
//! two distinct instances of that kind within the rolling failure run.
//!
//! In HalfOpen, at most one concurrent probe per key is admitted; other
//! callers fail fast with `CircuitOpen`.

use crate::audit::Auditor;
use crate::config::BreakerConfig;
use fm_core::{
    AuditEntry, BreakerKey, BreakerPhase, BreakerSnapshot, Clock, EntityKind, Event, InstanceId,
    RuntimeKind,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct BreakerEntry {
    phase: BreakerPhase,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    last_failure_ms: Option<u64>,
    opened_at: Option<Instant>,
    opened_at_ms: Option<u64>,
    /// Distinct failing instances; drives provider-wide opening
    failing_instances: HashSet<InstanceId>,
    /// True while the single HalfOpen probe is in flight
    probe_in_flight: bool,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_failure_ms: None,
            opened_at: None,
            opened_at_ms: None,
            failing_instances: HashSet::new(),
            probe_in_flight: false,
        }
    }
}

/// Outcome of asking a breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Call may proceed normally
    Allow,
    /// Call may proceed as the single HalfOpen probe
    AllowProbe,
    /// Call must fail fast with CircuitOpen
    Reject,
}

/// All breaker state, keyed per (kind[, instance]).
pub struct BreakerBoard {
    config: BreakerConfig,
    /// Per-key threshold overrides; the default config applies otherwise
    overrides: Mutex<HashMap<BreakerKey, BreakerConfig>>,
    auditor: Auditor,
    entries: Mutex<HashMap<BreakerKey, BreakerEntry>>,
}

impl BreakerBoard {
    pub fn new(config: BreakerConfig, auditor: Auditor) -> Self {
        Self {
            config,
            overrides: Mutex::new(HashMap::new()),
            auditor,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Override thresholds for one key.
    pub fn set_config(&self, key: BreakerKey, config: BreakerConfig) {
        self.overrides.lock().insert(key, config);
    }

    fn config_for(&self, key: &BreakerKey) -> BreakerConfig {
        self.overrides.lock().get(key).cloned().unwrap_or_else(|| self.config.clone())
    }

    /// Current phase for a key (Closed when never touched).
    pub fn phase(&self, key: &BreakerKey) -> BreakerPhase {
        self.entries.lock().get(key).map(|e| e.phase).unwrap_or_default()
    }

    /// Whether routing should exclude this key outright.
    pub fn is_open(&self, key: &BreakerKey, clock: &impl Clock) -> bool {
        matches!(self.admit_inner(key, clock, false), BreakerDecision::Reject)
    }

    /// Ask permission to call through `key`. May transition Open→HalfOpen
    /// when the reset window has elapsed; in HalfOpen admits exactly one
    /// concurrent probe.
    pub fn admit(&self, key: &BreakerKey, clock: &impl Clock) -> BreakerDecision {
        self.admit_inner(key, clock, true)
    }

    fn admit_inner(
        &self,
        key: &BreakerKey,
        clock: &impl Clock,
        take_probe: bool,
    ) -> BreakerDecision {
        let config = self.config_for(key);
        let mut entries = self.entries.lock();
        let entry = entries.entry(*key).or_default();

        match entry.phase {
            BreakerPhase::Closed => BreakerDecision::Allow,
            BreakerPhase::Open => {
                let elapsed = entry.opened_at.map(|at| clock.now().duration_since(at));
                if elapsed.map(|e| e >= config.reset_after).unwrap_or(false) {
                    if !take_probe {
                        return BreakerDecision::AllowProbe;
                    }
                    entry.phase = BreakerPhase::HalfOpen;
                    entry.success_count = 0;
                    entry.probe_in_flight = true;
                    drop(entries);
                    self.audit_transition(key, BreakerPhase::Open, BreakerPhase::HalfOpen, clock);
                    BreakerDecision::AllowProbe
                } else {
                    BreakerDecision::Reject
                }
            }
            BreakerPhase::HalfOpen => {
                if entry.probe_in_flight {
                    BreakerDecision::Reject
                } else if take_probe {
                    entry.probe_in_flight = true;
                    BreakerDecision::AllowProbe
                } else {
                    BreakerDecision::AllowProbe
                }
            }
        }
    }

    /// Record a successful call through both keys for this (kind, instance).
    pub fn record_success(&self, kind: RuntimeKind, instance: InstanceId, clock: &impl Clock) {
        for key in [BreakerKey::instance(kind, instance), BreakerKey::provider(kind)] {
            self.record_success_key(&key, clock);
        }
    }

    fn record_success_key(&self, key: &BreakerKey, clock: &impl Clock) {
        let config = self.config_for(key);
        let transition = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(*key).or_default();
            entry.probe_in_flight = false;
            match entry.phase {
                BreakerPhase::Closed => {
                    entry.failure_count = 0;
                    entry.failing_instances.clear();
                    None
                }
                BreakerPhase::HalfOpen => {
                    entry.success_count += 1;
                    if entry.success_count >= config.success_threshold {
                        entry.phase = BreakerPhase::Closed;
                        entry.failure_count = 0;
                        entry.success_count = 0;
                        entry.failing_instances.clear();
                        entry.opened_at = None;
                        entry.opened_at_ms = None;
                        Some((BreakerPhase::HalfOpen, BreakerPhase::Closed))
                    } else {
                        None
                    }
                }
                // Success while Open can only be a stale in-flight call; ignore.
                BreakerPhase::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            self.audit_transition(key, from, to, clock);
        }
    }

    /// Record a failed call through both keys for this (kind, instance).
    pub fn record_failure(&self, kind: RuntimeKind, instance: InstanceId, clock: &impl Clock) {
        self.record_failure_key(&BreakerKey::instance(kind, instance), Some(instance), clock);
        self.record_failure_key(&BreakerKey::provider(kind), Some(instance), clock);
    }

    fn record_failure_key(
        &self,
        key: &BreakerKey,
        instance: Option<InstanceId>,
        clock: &impl Clock,
    ) {
        let config = self.config_for(key);
        let transition = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(*key).or_default();
            entry.probe_in_flight = false;
            entry.failure_count += 1;
            entry.last_failure_at = Some(clock.now());
            entry.last_failure_ms = Some(clock.epoch_ms());
            if let Some(instance) = instance {
                entry.failing_instances.insert(instance);
            }

            let open_now = match entry.phase {
                BreakerPhase::HalfOpen => true,
                BreakerPhase::Closed => {
                    let threshold_hit = entry.failure_count >= config.failure_threshold;
                    let spread_ok = key.instance_id.is_some()
                        || entry.failing_instances.len() >= config.provider_wide_min_instances;
                    threshold_hit && spread_ok
                }
                BreakerPhase::Open => false,
            };

            if open_now {
                let from = entry.phase;
                entry.phase = BreakerPhase::Open;
                entry.success_count = 0;
                entry.opened_at = Some(clock.now());
                entry.opened_at_ms = Some(clock.epoch_ms());
                Some((from, BreakerPhase::Open))
            } else {
                None
            }
        };

        if let Some((from, to)) = transition {
            debug!(key = %key, "breaker opened");
            self.audit_transition(key, from, to, clock);
        }
    }

    /// Seconds-precision decay input for the router's failure penalty.
    pub fn last_failure_age(&self, key: &BreakerKey, clock: &impl Clock) -> Option<std::time::Duration> {
        self.entries
            .lock()
            .get(key)
            .and_then(|e| e.last_failure_at)
            .map(|at| clock.now().duration_since(at))
    }

    fn snapshot_of(&self, key: &BreakerKey) -> BreakerSnapshot {
        let entries = self.entries.lock();
        let entry = entries.get(key);
        BreakerSnapshot {
            key: *key,
            phase: entry.map(|e| e.phase).unwrap_or_default(),
            failure_count: entry.map(|e| e.failure_count).unwrap_or(0),
            last_failure_ms: entry.and_then(|e| e.last_failure_ms),
            opened_at_ms: entry.and_then(|e| e.opened_at_ms),
            schema_version: 1,
        }
    }

    fn audit_transition(
        &self,
        key: &BreakerKey,
        from: BreakerPhase,
        to: BreakerPhase,
        clock: &impl Clock,
    ) {
        let snapshot = self.snapshot_of(key);
        let payload = match serde_json::to_value(&snapshot) {
            Ok(v) => v,
            Err(_) => serde_json::Value::Null,
        };
        let entry = AuditEntry::new(
            clock.epoch_ms(),
            EntityKind::Breaker,
            key.to_string(),
            from.to_string(),
            to.to_string(),
            "breaker",
            None,
            payload,
        );
        let event = Event::BreakerTransition {
            key: key.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            instance_id: key.instance_id,
        };
        if let Err(e) = self.auditor.record(entry, vec![event]) {
            tracing::warn!(key = %key, error = %e, "breaker transition audit failed");
        }
    }

    /// Release a HalfOpen probe slot without recording an outcome
    /// (cancelled or never-issued call).
    pub fn release_probe(&self, key: &BreakerKey) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.probe_in_flight = false;
        }
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
