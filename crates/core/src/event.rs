// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle events published on the bus.
//!
//! Serializes with `{"type": "family:verb", ...fields}` format. Delivery is
//! at-least-once, per-subscriber FIFO; events flagged audit-true are flushed
//! to durable storage before publication completes.

use crate::error::ErrorKind;
use crate::instance::{HealthStatus, InstanceId, LoadSnapshot};
use crate::runtime::RuntimeKind;
use crate::task::{Priority, TaskId};
use serde::{Deserialize, Serialize};

/// Events describing state changes in the federation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // -- task --
    #[serde(rename = "task:submitted")]
    TaskSubmitted {
        id: TaskId,
        tenant: String,
        priority: Priority,
        #[serde(default)]
        correlation_id: String,
    },

    #[serde(rename = "task:admitted")]
    TaskAdmitted { id: TaskId, tenant: String },

    #[serde(rename = "task:rejected")]
    TaskRejected {
        id: TaskId,
        tenant: String,
        kind: ErrorKind,
        reason: String,
    },

    /// Router picked an instance; alternatives are recorded for audit.
    #[serde(rename = "task:routed")]
    TaskRouted {
        id: TaskId,
        tenant: String,
        instance_id: InstanceId,
        runtime_kind: RuntimeKind,
        /// Winning score scaled by 1000 for stable serialization
        score_milli: i64,
        #[serde(default)]
        alternatives: Vec<InstanceId>,
    },

    #[serde(rename = "task:started")]
    TaskStarted {
        id: TaskId,
        tenant: String,
        instance_id: InstanceId,
        attempt: u32,
    },

    #[serde(rename = "task:attempt_failed")]
    TaskAttemptFailed {
        id: TaskId,
        tenant: String,
        instance_id: InstanceId,
        runtime_kind: RuntimeKind,
        attempt: u32,
        kind: ErrorKind,
        error: String,
    },

    /// Policy refused a descent to a weaker runtime kind.
    #[serde(rename = "task:fallback_blocked")]
    TaskFallbackBlocked {
        id: TaskId,
        tenant: String,
        runtime_kind: RuntimeKind,
    },

    #[serde(rename = "task:completed")]
    TaskCompleted {
        id: TaskId,
        tenant: String,
        cost_units: u64,
    },

    #[serde(rename = "task:failed")]
    TaskFailed {
        id: TaskId,
        tenant: String,
        kind: ErrorKind,
        error: String,
    },

    #[serde(rename = "task:cancelled")]
    TaskCancelled { id: TaskId, tenant: String },

    #[serde(rename = "task:timed_out")]
    TaskTimedOut { id: TaskId, tenant: String },

    // -- instance --
    #[serde(rename = "instance:registered")]
    InstanceRegistered {
        id: InstanceId,
        endpoint: String,
        region: String,
        runtime_kinds: Vec<RuntimeKind>,
    },

    /// Load report from a worker; volatile, not audited.
    #[serde(rename = "instance:heartbeat")]
    InstanceHeartbeat { id: InstanceId, load: LoadSnapshot },

    #[serde(rename = "instance:health_changed")]
    InstanceHealthChanged {
        id: InstanceId,
        from: HealthStatus,
        to: HealthStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "instance:draining")]
    InstanceDraining { id: InstanceId, deadline_ms: u64 },

    #[serde(rename = "instance:removed")]
    InstanceRemoved { id: InstanceId, reason: String },

    // -- breaker --
    #[serde(rename = "breaker:transition")]
    BreakerTransition {
        key: String,
        from: String,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<InstanceId>,
    },

    // -- budget --
    #[serde(rename = "budget:reserved")]
    BudgetReserved { tenant: String, amount: u64 },

    #[serde(rename = "budget:reconciled")]
    BudgetReconciled {
        tenant: String,
        reserved: u64,
        observed: u64,
    },

    /// Observed cost exceeded the reservation beyond the configured slack.
    #[serde(rename = "budget:overshoot")]
    BudgetOvershoot {
        tenant: String,
        reserved: u64,
        observed: u64,
    },

    /// Running total crossed a warning/critical threshold.
    #[serde(rename = "budget:alert")]
    BudgetAlert { tenant: String, threshold_pct: u8 },

    #[serde(rename = "budget:reset")]
    BudgetReset { tenant: String, reset_at_ms: u64 },

    // -- system --
    #[serde(rename = "system:shutdown")]
    Shutdown,

    /// Catch-all for unknown event types (extensibility)
    #[serde(other, skip_serializing)]
    Custom,
}

impl Event {
    /// Stable event type tag, matching the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TaskSubmitted { .. } => "task:submitted",
            Event::TaskAdmitted { .. } => "task:admitted",
            Event::TaskRejected { .. } => "task:rejected",
            Event::TaskRouted { .. } => "task:routed",
            Event::TaskStarted { .. } => "task:started",
            Event::TaskAttemptFailed { .. } => "task:attempt_failed",
            Event::TaskFallbackBlocked { .. } => "task:fallback_blocked",
            Event::TaskCompleted { .. } => "task:completed",
            Event::TaskFailed { .. } => "task:failed",
            Event::TaskCancelled { .. } => "task:cancelled",
            Event::TaskTimedOut { .. } => "task:timed_out",
            Event::InstanceRegistered { .. } => "instance:registered",
            Event::InstanceHeartbeat { .. } => "instance:heartbeat",
            Event::InstanceHealthChanged { .. } => "instance:health_changed",
            Event::InstanceDraining { .. } => "instance:draining",
            Event::InstanceRemoved { .. } => "instance:removed",
            Event::BreakerTransition { .. } => "breaker:transition",
            Event::BudgetReserved { .. } => "budget:reserved",
            Event::BudgetReconciled { .. } => "budget:reconciled",
            Event::BudgetOvershoot { .. } => "budget:overshoot",
            Event::BudgetAlert { .. } => "budget:alert",
            Event::BudgetReset { .. } => "budget:reset",
            Event::Shutdown => "system:shutdown",
            Event::Custom => "custom",
        }
    }

    /// Whether the bus must flush durable storage before delivery.
    pub fn is_audit(&self) -> bool {
        matches!(
            self,
            Event::InstanceHealthChanged { .. }
                | Event::InstanceRemoved { .. }
                | Event::TaskRouted { .. }
                | Event::TaskFailed { .. }
                | Event::TaskCompleted { .. }
                | Event::TaskTimedOut { .. }
                | Event::TaskCancelled { .. }
                | Event::BreakerTransition { .. }
        )
    }

    /// Tenant association, when the event has one.
    pub fn tenant(&self) -> Option<&str> {
        match self {
            Event::TaskSubmitted { tenant, .. }
            | Event::TaskAdmitted { tenant, .. }
            | Event::TaskRejected { tenant, .. }
            | Event::TaskRouted { tenant, .. }
            | Event::TaskStarted { tenant, .. }
            | Event::TaskAttemptFailed { tenant, .. }
            | Event::TaskFallbackBlocked { tenant, .. }
            | Event::TaskCompleted { tenant, .. }
            | Event::TaskFailed { tenant, .. }
            | Event::TaskCancelled { tenant, .. }
            | Event::TaskTimedOut { tenant, .. }
            | Event::BudgetReserved { tenant, .. }
            | Event::BudgetReconciled { tenant, .. }
            | Event::BudgetOvershoot { tenant, .. }
            | Event::BudgetAlert { tenant, .. }
            | Event::BudgetReset { tenant, .. } => Some(tenant),
            _ => None,
        }
    }

    /// Task association, when the event has one.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Event::TaskSubmitted { id, .. }
            | Event::TaskAdmitted { id, .. }
            | Event::TaskRejected { id, .. }
            | Event::TaskRouted { id, .. }
            | Event::TaskStarted { id, .. }
            | Event::TaskAttemptFailed { id, .. }
            | Event::TaskFallbackBlocked { id, .. }
            | Event::TaskCompleted { id, .. }
            | Event::TaskFailed { id, .. }
            | Event::TaskCancelled { id, .. }
            | Event::TaskTimedOut { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Instance association, when the event has one.
    pub fn instance_id(&self) -> Option<InstanceId> {
        match self {
            Event::TaskRouted { instance_id, .. }
            | Event::TaskStarted { instance_id, .. }
            | Event::TaskAttemptFailed { instance_id, .. } => Some(*instance_id),
            Event::InstanceRegistered { id, .. }
            | Event::InstanceHeartbeat { id, .. }
            | Event::InstanceHealthChanged { id, .. }
            | Event::InstanceDraining { id, .. }
            | Event::InstanceRemoved { id, .. } => Some(*id),
            Event::BreakerTransition { instance_id, .. } => *instance_id,
            _ => None,
        }
    }
}

/// Pure predicate over events, used by subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Match event type tags exactly; empty matches all. A trailing `:*`
    /// matches a family prefix (e.g. `task:*`).
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
}

impl EventFilter {
    /// Filter that matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.types.is_empty() {
            let kind = event.kind();
            let hit = self.types.iter().any(|t| {
                t.strip_suffix(":*")
                    .map(|family| {
                        kind.split(':').next().map(|k| k == family).unwrap_or(false)
                    })
                    .unwrap_or_else(|| t == kind)
            });
            if !hit {
                return false;
            }
        }
        if let Some(tenant) = &self.tenant {
            if event.tenant() != Some(tenant.as_str()) {
                return false;
            }
        }
        if let Some(task_id) = &self.task_id {
            if event.task_id() != Some(*task_id) {
                return false;
            }
        }
        if let Some(instance_id) = &self.instance_id {
            if event.instance_id() != Some(*instance_id) {
                return false;
            }
        }
        true
    }
}

/// Where components publish lifecycle events.
///
/// `publish` must never block the caller; slow consumers lose events on
/// their own queues only.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: Event);
}

/// Sink that discards everything; for tests and headless embedding.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: Event) {}
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
