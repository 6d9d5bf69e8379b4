// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Candidate filtering, scoring, and deterministic selection.
//!
//! The router is a pure function over snapshots: given a task, the
//! membership snapshot, and the breaker view, it either picks exactly one
//! instance or refuses. Determinism matters for reproducibility; ties break
//! on the lexicographically smallest instance id.

use crate::breaker::BreakerBoard;
use crate::config::RouterConfig;
use fm_core::{BreakerKey, Clock, HealthStatus, Instance, InstanceId, RuntimeKind, Task};

/// A routing decision with the audit trail of alternatives considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub instance_id: InstanceId,
    pub runtime_kind: RuntimeKind,
    /// Winning score scaled by 1000
    pub score_milli: i64,
    pub alternatives: Vec<InstanceId>,
}

/// Why no instance was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// Global utilization at or above the reject threshold
    FederationCapacity,
    /// Filtering left no candidate
    NoEligibleInstance,
}

/// Stateless selector configured with scoring weights.
pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Global session-slot utilization across healthy and degraded
    /// instances.
    pub fn global_utilization(instances: &[Instance]) -> f64 {
        let (active, ceiling) = instances
            .iter()
            .filter(|i| {
                matches!(i.health.status, HealthStatus::Healthy | HealthStatus::Degraded)
            })
            .fold((0u64, 0u64), |(active, ceiling), i| {
                (
                    active + u64::from(i.load.active_sessions),
                    ceiling + u64::from(i.ceilings.max_sessions),
                )
            });
        if ceiling == 0 {
            return 0.0;
        }
        active as f64 / ceiling as f64
    }

    /// Fail fast when the federation is saturated.
    pub fn check_backpressure(&self, instances: &[Instance]) -> Result<(), RouteError> {
        if Self::global_utilization(instances) >= self.config.reject_threshold {
            return Err(RouteError::FederationCapacity);
        }
        Ok(())
    }

    /// Select one instance for the task on the given runtime kind.
    ///
    /// `affinity` is the instance that previously served the task's
    /// workspace; it wins outright if still eligible. `occupied` /
    /// `max_instances` enforce the tenant's instance-spread quota.
    #[allow(clippy::too_many_arguments)]
    pub fn select<C: Clock>(
        &self,
        task: &Task,
        kind: RuntimeKind,
        instances: &[Instance],
        breakers: &BreakerBoard,
        affinity: Option<InstanceId>,
        occupied: &[InstanceId],
        max_instances: Option<u32>,
        clock: &C,
    ) -> Result<RouteDecision, RouteError> {
        let candidates = self.filter(task, kind, instances, breakers, occupied, max_instances, clock);
        if candidates.is_empty() {
            return Err(RouteError::NoEligibleInstance);
        }

        if let Some(preferred) = affinity {
            if let Some(instance) = candidates.iter().find(|i| i.id == preferred) {
                let score_milli = self.score_milli(task, kind, instance, breakers, clock);
                let alternatives =
                    candidates.iter().map(|i| i.id).filter(|id| *id != preferred).collect();
                return Ok(RouteDecision {
                    instance_id: preferred,
                    runtime_kind: kind,
                    score_milli,
                    alternatives,
                });
            }
        }

        let mut scored: Vec<(i64, InstanceId)> = candidates
            .iter()
            .map(|instance| (self.score_milli(task, kind, instance, breakers, clock), instance.id))
            .collect();
        // Highest score first; ties pick the lexicographically smallest id.
        scored.sort_by(|(score_a, id_a), (score_b, id_b)| {
            score_b.cmp(score_a).then_with(|| id_a.as_str().cmp(id_b.as_str()))
        });

        let (score_milli, instance_id) = scored[0];
        let alternatives = scored.iter().skip(1).map(|(_, id)| *id).collect();
        Ok(RouteDecision { instance_id, runtime_kind: kind, score_milli, alternatives })
    }

    /// Candidate filter per the admission rules; prefers healthy instances
    /// and only falls back to degraded ones when no healthy candidate
    /// remains.
    fn filter<'a, C: Clock>(
        &self,
        task: &Task,
        kind: RuntimeKind,
        instances: &'a [Instance],
        breakers: &BreakerBoard,
        occupied: &[InstanceId],
        max_instances: Option<u32>,
        clock: &C,
    ) -> Vec<&'a Instance> {
        let spread_full = max_instances
            .map(|max| occupied.len() >= max as usize)
            .unwrap_or(false);

        let eligible = |instance: &&Instance| -> bool {
            if !instance.accepts_dispatch() || !instance.has_capacity() || !instance.offers(kind) {
                return false;
            }
            if !task
                .spec
                .required_capabilities
                .iter()
                .all(|cap| instance.capabilities.contains(cap))
            {
                return false;
            }
            if spread_full && !occupied.contains(&instance.id) {
                return false;
            }
            if breakers.is_open(&BreakerKey::instance(kind, instance.id), clock) {
                return false;
            }
            true
        };

        let mut candidates: Vec<&Instance> = instances.iter().filter(eligible).collect();

        // Degraded instances are a last resort.
        if candidates.iter().any(|i| i.health.status == HealthStatus::Healthy) {
            candidates.retain(|i| i.health.status == HealthStatus::Healthy);
        }

        // Preferred region binds only when at least one candidate is in it.
        if let Some(region) = &task.spec.preferred_region {
            if candidates.iter().any(|i| &i.region == region) {
                candidates.retain(|i| &i.region == region);
            }
        }

        candidates
    }

    /// Score = w1·(1−util) + w2·(1−queueNorm) + w3·regionMatch
    ///       + w4·capabilityExcess − w5·recentFailurePenalty,
    /// scaled by 1000 and rounded for stable ordering.
    fn score_milli<C: Clock>(
        &self,
        task: &Task,
        kind: RuntimeKind,
        instance: &Instance,
        breakers: &BreakerBoard,
        clock: &C,
    ) -> i64 {
        let w = &self.config;

        let util_term = w.w_util * (1.0 - instance.session_util());
        let queue_term = w.w_queue * (1.0 - instance.queue_norm());

        let region_match = task
            .spec
            .preferred_region
            .as_ref()
            .map(|r| if &instance.region == r { 1.0 } else { 0.0 })
            .unwrap_or(0.0);
        let region_term = w.w_region * region_match;

        let excess = instance
            .capabilities
            .len()
            .saturating_sub(task.spec.required_capabilities.len()) as f64;
        let capability_term = w.w_capability * (excess.min(5.0) / 5.0);

        // Exponential decay with time since the last failure on this
        // (instance, provider) key.
        let penalty = breakers
            .last_failure_age(&BreakerKey::instance(kind, instance.id), clock)
            .map(|age| {
                let half_lives = age.as_secs_f64() / self.config.failure_half_life.as_secs_f64();
                0.5f64.powf(half_lives)
            })
            .unwrap_or(0.0);
        let failure_term = w.w_failure * penalty;

        let score = util_term + queue_term + region_term + capability_term - failure_term;
        (score * 1000.0).round() as i64
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
