// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-(tenant, priority) FIFO admission queues.
//!
//! The dispatch loop drains priorities strictly highest-first; within one
//! priority, tenants round-robin and each tenant's tasks stay FIFO. Higher
//! priorities preempt scheduling order only, never a running task.

use fm_core::{Priority, TaskId};
use indexmap::IndexMap;
use std::collections::VecDeque;

#[derive(Debug, Default)]
struct PriorityLane {
    /// Tenant → FIFO of queued tasks. IndexMap keeps round-robin order stable.
    tenants: IndexMap<String, VecDeque<TaskId>>,
    /// Round-robin cursor over tenants
    cursor: usize,
}

impl PriorityLane {
    fn push(&mut self, tenant: &str, task_id: TaskId) {
        self.tenants.entry(tenant.to_string()).or_default().push_back(task_id);
    }

    fn pop(&mut self) -> Option<TaskId> {
        if self.tenants.is_empty() {
            return None;
        }
        let len = self.tenants.len();
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            if let Some((_, queue)) = self.tenants.get_index_mut(idx) {
                if let Some(task_id) = queue.pop_front() {
                    self.cursor = (idx + 1) % len;
                    return Some(task_id);
                }
            }
        }
        None
    }

    fn remove(&mut self, task_id: &TaskId) -> bool {
        for (_, queue) in self.tenants.iter_mut() {
            if let Some(pos) = queue.iter().position(|id| id == task_id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    fn depth(&self, tenant: &str) -> usize {
        self.tenants.get(tenant).map(|q| q.len()).unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.tenants.values().map(|q| q.len()).sum()
    }
}

/// Admission queues, one lane per priority class.
#[derive(Debug, Default)]
pub struct DispatchQueues {
    lanes: [PriorityLane; 4],
}

fn lane_index(priority: Priority) -> usize {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
    }
}

impl DispatchQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tenant: &str, priority: Priority, task_id: TaskId) {
        self.lanes[lane_index(priority)].push(tenant, task_id);
    }

    /// Next task to dispatch: highest priority first, round-robin across
    /// tenants, FIFO within a tenant.
    pub fn pop(&mut self) -> Option<TaskId> {
        self.lanes.iter_mut().find_map(|lane| lane.pop())
    }

    /// Remove a queued task (cancellation before dispatch).
    pub fn remove(&mut self, task_id: &TaskId) -> bool {
        self.lanes.iter_mut().any(|lane| lane.remove(task_id))
    }

    /// Queue depth for one (tenant, priority).
    pub fn depth(&self, tenant: &str, priority: Priority) -> usize {
        self.lanes[lane_index(priority)].depth(tenant)
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "queues_tests.rs"]
mod tests;
