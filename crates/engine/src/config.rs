// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine configuration with shipped defaults.
//!
//! Defaults follow operator guidance; Degraded/Unhealthy boundaries are
//! intentionally configurable rather than fixed.

use std::time::Duration;

/// Router weights and admission thresholds.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Global utilization at or above which admission is rejected
    pub reject_threshold: f64,
    /// Weight on free session capacity (1 - util)
    pub w_util: f64,
    /// Weight on shallow queues (1 - queue depth norm)
    pub w_queue: f64,
    /// Weight on preferred-region match
    pub w_region: f64,
    /// Weight on capability excess beyond the task's requirements
    pub w_capability: f64,
    /// Weight on the recent-failure penalty
    pub w_failure: f64,
    /// Half-life of the failure penalty decay
    pub failure_half_life: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            reject_threshold: 0.95,
            w_util: 0.4,
            w_queue: 0.2,
            w_region: 0.2,
            w_capability: 0.1,
            w_failure: 0.3,
            failure_half_life: Duration::from_secs(60),
        }
    }
}

/// Health monitor thresholds.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    /// Probe latency above which a healthy instance degrades
    pub degraded_latency: Duration,
    /// Utilization above which a healthy instance degrades
    pub degraded_util: f64,
    pub unhealthy_consecutive_failures: u32,
    pub healthy_consecutive_successes: u32,
    /// Continuous time in Unhealthy after which the instance is removed
    pub remove_after: Duration,
    /// Probe pool ceiling; effective size is min(this, instance count)
    pub probe_pool_max: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            degraded_latency: Duration::from_millis(750),
            degraded_util: 0.85,
            unhealthy_consecutive_failures: 3,
            healthy_consecutive_successes: 2,
            remove_after: Duration::from_secs(300),
            probe_pool_max: 32,
        }
    }
}

/// Circuit breaker thresholds, applied per key.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_after: Duration,
    /// Distinct instances that must fail before a provider-wide key opens
    pub provider_wide_min_instances: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_after: Duration::from_secs(30),
            provider_wide_min_instances: 2,
        }
    }
}

/// Budget gate thresholds and reset schedule.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// UTC hour at which daily/monthly windows reset
    pub reset_hour_utc: u32,
    /// Alert thresholds as consumed percentages
    pub warn_pct: u8,
    pub crit_pct: u8,
    /// Tolerated overshoot of observed cost beyond the reservation,
    /// as a fraction of the reservation
    pub overshoot_slack: f64,
    /// When true, tenants without a configured budget are refused admission
    /// (absent an override). When false, such tenants are ungoverned.
    pub require_budget: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            reset_hour_utc: 0,
            warn_pct: 75,
            crit_pct: 90,
            overshoot_slack: 0.25,
            require_budget: false,
        }
    }
}

/// Drain and cancellation grace windows.
#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// How long a deregistered instance may finish existing tasks
    pub drain_deadline: Duration,
    /// How long to wait for a provider to confirm cancellation
    pub cancel_grace: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self { drain_deadline: Duration::from_secs(120), cancel_grace: Duration::from_secs(10) }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub router: RouterConfig,
    pub health: HealthConfig,
    pub breaker: BreakerConfig,
    pub budget: BudgetConfig,
    pub drain: DrainConfig,
}
