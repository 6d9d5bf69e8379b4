// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tenant budget and quota records.
//!
//! These are the durable snapshot forms; the live counters (compare-and-swap
//! cells) are owned by the budget gate in the engine.

use serde::{Deserialize, Serialize};

/// Window over which a budget accumulates before resetting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BudgetScope {
    Daily,
    Monthly,
    TaskLocal,
}

crate::simple_display! {
    BudgetScope {
        Daily => "daily",
        Monthly => "monthly",
        TaskLocal => "task-local",
    }
}

/// Durable budget record for one tenant.
///
/// `consumed` is maintained by the gate via compare-and-swap and reconciled
/// against observed attempt cost after completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantBudget {
    pub tenant: String,
    pub scope: BudgetScope,
    /// Ceiling in cost units
    pub limit: u64,
    pub consumed: u64,
    /// Epoch milliseconds when the window resets next
    pub reset_at_ms: u64,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    1
}

impl TenantBudget {
    pub fn new(tenant: impl Into<String>, scope: BudgetScope, limit: u64, reset_at_ms: u64) -> Self {
        Self { tenant: tenant.into(), scope, limit, consumed: 0, reset_at_ms, schema_version: 1 }
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed)
    }

    /// Consumed fraction of the limit in [0, 1] (1.0 for a zero limit).
    pub fn consumed_pct(&self) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }
        self.consumed as f64 / self.limit as f64
    }
}

/// Per-tenant concurrency ceilings, enforced at admission and routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub tenant: String,
    pub max_active_tasks: u32,
    /// Maximum distinct instances a tenant may occupy concurrently
    pub max_instances: u32,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl Quota {
    pub fn new(tenant: impl Into<String>, max_active_tasks: u32, max_instances: u32) -> Self {
        Self { tenant: tenant.into(), max_active_tasks, max_instances, schema_version: 1 }
    }
}

#[cfg(test)]
#[path = "budget_tests.rs"]
mod tests;
