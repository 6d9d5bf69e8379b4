// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Timer management for the engine loop.

use fm_core::{InstanceId, TaskId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What a timer means when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Task deadline reached
    TaskDeadline(TaskId),
    /// Provider did not confirm cancellation in time
    CancelGrace(TaskId),
    /// Re-run the health probe cycle
    ProbeCycle,
    /// Check daily/monthly budget windows
    BudgetReset,
    /// Re-queue a capacity-deferred task
    RouteCooldown(TaskId),
    /// Draining instance ran out of time
    DrainDeadline(InstanceId),
    /// Periodic state checkpoint
    CheckpointTick,
}

#[derive(Debug, Clone)]
struct Timer {
    fires_at: Instant,
}

/// Manages timers for the runtime
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: HashMap<TimerKind, Timer>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or reset) a timer.
    pub fn set_timer(&mut self, kind: TimerKind, duration: Duration, now: Instant) {
        let fires_at = now + duration;
        self.timers.insert(kind, Timer { fires_at });
    }

    /// Cancel a timer.
    pub fn cancel_timer(&mut self, kind: &TimerKind) {
        self.timers.remove(kind);
    }

    /// Cancel all timers referencing a task.
    pub fn cancel_task_timers(&mut self, task_id: &TaskId) {
        self.timers.retain(|kind, _| {
            !matches!(kind,
                TimerKind::TaskDeadline(id)
                | TimerKind::CancelGrace(id)
                | TimerKind::RouteCooldown(id) if id == task_id)
        });
    }

    /// Remove and return all timers that have fired.
    pub fn fired_timers(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired: Vec<TimerKind> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.fires_at <= now)
            .map(|(kind, _)| kind.clone())
            .collect();
        // Stable order keeps replay deterministic.
        fired.sort_by_key(|kind| self.timers.get(kind).map(|t| t.fires_at));

        for kind in &fired {
            self.timers.remove(kind);
        }
        fired
    }

    /// Earliest pending fire time.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.fires_at).min()
    }

    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
