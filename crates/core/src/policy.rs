// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tenant policy interface, consumed by the fallback orchestrator.

use crate::runtime::{RuntimeKind, DEFAULT_LADDER};
use crate::task::Task;
use std::collections::{HashMap, HashSet};

/// Decides which runtime kinds a task may use and whether it may fall back.
pub trait Policy: Send + Sync + 'static {
    /// Ordered fallback ladder for the task, strongest preference first.
    fn allowed_runtime_kinds(&self, tenant: &str, task: &Task) -> Vec<RuntimeKind>;

    /// Whether the task may descend to `kind` after a failed attempt on an
    /// earlier rung of its ladder.
    fn may_fallback_to(&self, task: &Task, kind: RuntimeKind) -> bool;

    /// Whether the task is classified high-risk for this tenant.
    fn is_high_risk(&self, tenant: &str, task: &Task) -> bool;
}

/// Table-driven policy: per-tenant forbidden kinds plus a high-risk tenant set.
///
/// High-risk tasks may never fall back to a kind with a lower isolation rank
/// than every kind already permitted to them; in practice this blocks the
/// descent to `HostSandbox`.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    forbidden: HashMap<String, HashSet<RuntimeKind>>,
    high_risk_tenants: HashSet<String>,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forbid(mut self, tenant: impl Into<String>, kind: RuntimeKind) -> Self {
        self.forbidden.entry(tenant.into()).or_default().insert(kind);
        self
    }

    pub fn high_risk(mut self, tenant: impl Into<String>) -> Self {
        self.high_risk_tenants.insert(tenant.into());
        self
    }
}

impl Policy for StaticPolicy {
    fn allowed_runtime_kinds(&self, tenant: &str, _task: &Task) -> Vec<RuntimeKind> {
        let forbidden = self.forbidden.get(tenant);
        DEFAULT_LADDER
            .iter()
            .copied()
            .filter(|kind| forbidden.map(|f| !f.contains(kind)).unwrap_or(true))
            .collect()
    }

    fn may_fallback_to(&self, task: &Task, kind: RuntimeKind) -> bool {
        if let Some(forbidden) = self.forbidden.get(&task.spec.tenant) {
            if forbidden.contains(&kind) {
                return false;
            }
        }
        if self.high_risk_tenants.contains(&task.spec.tenant) {
            // Weakest rung is off limits for high-risk work.
            return kind != RuntimeKind::HostSandbox;
        }
        true
    }

    fn is_high_risk(&self, tenant: &str, _task: &Task) -> bool {
        self.high_risk_tenants.contains(tenant)
    }
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
