// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized state from audit replay.
//!
//! The only durable-state mutator in the system: normal operation and
//! crash-recovery replay both go through [`MaterializedState::apply`], so
//! the two can never drift. Volatile signals (load snapshots, probe
//! bookkeeping) are written directly by their owning component and are not
//! part of the audit stream.

use fm_core::{
    Attempt, AuditEntry, BreakerSnapshot, EntityKind, Instance, Quota, Task, TenantBudget,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Attempt payload as carried by `EntityKind::Attempt` audit entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub task_id: String,
    pub attempt: Attempt,
}

/// Full durable state, reconstructed by replaying audit entries over a
/// checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterializedState {
    pub instances: HashMap<String, Instance>,
    pub tasks: HashMap<String, Task>,
    pub budgets: HashMap<String, TenantBudget>,
    pub quotas: HashMap<String, Quota>,
    pub breakers: HashMap<String, BreakerSnapshot>,
    /// Sequence of the last applied entry
    pub applied_seq: u64,
}

impl MaterializedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_instance(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    /// Count of non-terminal tasks for a tenant.
    pub fn active_task_count(&self, tenant: &str) -> usize {
        self.tasks
            .values()
            .filter(|t| t.spec.tenant == tenant && !t.is_terminal())
            .count()
    }

    /// Distinct instances currently running this tenant's tasks.
    pub fn occupied_instances(&self, tenant: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.spec.tenant == tenant && !t.is_terminal())
            .filter_map(|t| t.assigned.map(|i| i.to_string()))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Apply one audit entry. Idempotent for entries carrying snapshots:
    /// re-applying the same entry leaves the state unchanged.
    pub fn apply(&mut self, entry: &AuditEntry) {
        match entry.entity {
            EntityKind::Instance => {
                if entry.payload.is_null() {
                    self.instances.remove(&entry.entity_id);
                } else {
                    match serde_json::from_value::<Instance>(entry.payload.clone()) {
                        Ok(instance) => {
                            self.instances.insert(entry.entity_id.clone(), instance);
                        }
                        Err(e) => warn!(seq = entry.seq, error = %e, "bad instance payload, skipping"),
                    }
                }
            }
            EntityKind::Task => {
                if entry.payload.is_null() {
                    self.tasks.remove(&entry.entity_id);
                } else {
                    match serde_json::from_value::<Task>(entry.payload.clone()) {
                        Ok(task) => {
                            self.tasks.insert(entry.entity_id.clone(), task);
                        }
                        Err(e) => warn!(seq = entry.seq, error = %e, "bad task payload, skipping"),
                    }
                }
            }
            EntityKind::Attempt => {
                match serde_json::from_value::<AttemptRecord>(entry.payload.clone()) {
                    Ok(record) => {
                        if let Some(task) = self.tasks.get_mut(&record.task_id) {
                            let idx = record.attempt.index as usize;
                            if idx >= 1 && idx <= task.attempts.len() {
                                task.attempts[idx - 1] = record.attempt;
                            } else if idx == task.attempts.len() + 1 {
                                task.attempts.push(record.attempt);
                            } else {
                                warn!(
                                    seq = entry.seq,
                                    task = %record.task_id,
                                    index = idx,
                                    "attempt index out of sequence, skipping"
                                );
                            }
                        }
                    }
                    Err(e) => warn!(seq = entry.seq, error = %e, "bad attempt payload, skipping"),
                }
            }
            EntityKind::TenantBudget => {
                if entry.payload.is_null() {
                    self.budgets.remove(&entry.entity_id);
                } else {
                    match serde_json::from_value::<TenantBudget>(entry.payload.clone()) {
                        Ok(budget) => {
                            self.budgets.insert(entry.entity_id.clone(), budget);
                        }
                        Err(e) => warn!(seq = entry.seq, error = %e, "bad budget payload, skipping"),
                    }
                }
            }
            EntityKind::Breaker => {
                match serde_json::from_value::<BreakerSnapshot>(entry.payload.clone()) {
                    Ok(snapshot) => {
                        self.breakers.insert(entry.entity_id.clone(), snapshot);
                    }
                    Err(e) => warn!(seq = entry.seq, error = %e, "bad breaker payload, skipping"),
                }
            }
        }

        self.applied_seq = self.applied_seq.max(entry.seq);
    }

    /// Replay a batch of entries in order.
    pub fn replay<'a>(&mut self, entries: impl IntoIterator<Item = &'a AuditEntry>) {
        for entry in entries {
            self.apply(entry);
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
