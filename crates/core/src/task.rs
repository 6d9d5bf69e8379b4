// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task records, attempt history, and the canonical state machine.

use crate::error::{ErrorKind, TaskFailure};
use crate::instance::InstanceId;
use crate::retry::RetryPolicy;
use crate::runtime::RuntimeKind;
use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Unique identifier for a submitted task.
    pub struct TaskId("tsk-");
}

/// Scheduling priority. Higher priorities drain first; they never preempt
/// a running task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

crate::simple_display! {
    Priority {
        Low => "low",
        Normal => "normal",
        High => "high",
        Critical => "critical",
    }
}

impl Priority {
    /// All priorities, highest first; the drain order of the dispatch loop.
    pub const DESCENDING: [Priority; 4] =
        [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];
}

/// Canonical task lifecycle states. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Admitted,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

crate::simple_display! {
    TaskState {
        Queued => "queued",
        Admitted => "admitted",
        Dispatched => "dispatched",
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
        Cancelled => "cancelled",
        TimedOut => "timed_out",
    }
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled | TaskState::TimedOut
        )
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// Mirrors the lifecycle table: Queued → Admitted|Failed,
    /// Admitted → Dispatched, Dispatched → Running, Running → terminal or
    /// back to Dispatched for the next attempt. Cancellation is legal from
    /// every non-terminal state.
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == TaskState::Cancelled {
            return true;
        }
        matches!(
            (self, to),
            (TaskState::Queued, TaskState::Admitted)
                | (TaskState::Queued, TaskState::Failed)
                | (TaskState::Admitted, TaskState::Dispatched)
                | (TaskState::Admitted, TaskState::Failed)
                | (TaskState::Dispatched, TaskState::Running)
                | (TaskState::Dispatched, TaskState::Failed)
                | (TaskState::Running, TaskState::Succeeded)
                | (TaskState::Running, TaskState::Dispatched)
                | (TaskState::Running, TaskState::Failed)
                | (TaskState::Running, TaskState::TimedOut)
        )
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Running,
    Ok,
    Failed,
    Cancelled,
}

crate::simple_display! {
    AttemptOutcome {
        Running => "running",
        Ok => "ok",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

/// Record of one dispatch of a task to an instance.
///
/// Attempts form an ordered sequence; only the final attempt's outcome
/// determines the task's terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based index within the task
    pub index: u32,
    pub instance_id: InstanceId,
    pub runtime_kind: RuntimeKind,
    pub started_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Observed cost in cost units (0 until reconciled)
    #[serde(default)]
    pub cost_units: u64,
}

/// Client-supplied submission payload and constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub tenant: String,
    /// Opaque work payload, forwarded to the runtime session
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    /// Absolute deadline, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    /// Affinity key: tasks sharing a workspace prefer the instance that
    /// served the workspace last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Pre-admission cost estimate, reserved against the tenant budget
    #[serde(default)]
    pub cost_estimate: u64,
    /// Hard per-task cost ceiling (0 means unbounded)
    #[serde(default)]
    pub budget_ceiling: u64,
    /// Bypass the tenant budget gate; requires the budget.override
    /// permission, enforced at the transport boundary.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub budget_override: bool,
    #[serde(default)]
    pub correlation_id: String,
}

impl TaskSpec {
    pub fn new(tenant: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            tenant: tenant.into(),
            payload,
            priority: Priority::Normal,
            deadline_ms: None,
            required_capabilities: Vec::new(),
            preferred_region: None,
            max_latency_ms: None,
            workspace: None,
            retry: RetryPolicy::default(),
            cost_estimate: 0,
            budget_ceiling: 0,
            budget_override: false,
            correlation_id: String::new(),
        }
    }

    crate::setters! {
        into {
            correlation_id: String,
        }
        set {
            priority: Priority,
            required_capabilities: Vec<String>,
            retry: RetryPolicy,
            cost_estimate: u64,
            budget_ceiling: u64,
            budget_override: bool,
        }
        option {
            deadline_ms: u64,
            preferred_region: String,
            max_latency_ms: u64,
            workspace: String,
        }
    }
}

/// A task owned by the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    pub created_at_ms: u64,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    /// Instance currently responsible, set while Dispatched/Running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned: Option<InstanceId>,
    /// Final failure, set for Failed/Cancelled/TimedOut
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    /// Total observed cost across attempts
    #[serde(default)]
    pub cost_observed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admitted_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    1
}

impl Task {
    pub fn new(id: TaskId, spec: TaskSpec, created_at_ms: u64) -> Self {
        Self {
            id,
            spec,
            state: TaskState::Queued,
            created_at_ms,
            attempts: Vec::new(),
            assigned: None,
            failure: None,
            cost_observed: 0,
            admitted_at_ms: None,
            finished_at_ms: None,
            schema_version: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The attempt currently in flight, if any.
    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.attempts.last().filter(|a| a.outcome == AttemptOutcome::Running)
    }

    /// Begin a new attempt; returns its 1-based index.
    pub fn push_attempt(
        &mut self,
        instance_id: InstanceId,
        runtime_kind: RuntimeKind,
        started_at_ms: u64,
    ) -> u32 {
        let index = self.attempts.len() as u32 + 1;
        self.attempts.push(Attempt {
            index,
            instance_id,
            runtime_kind,
            started_at_ms,
            finished_at_ms: None,
            outcome: AttemptOutcome::Running,
            error_kind: None,
            error: None,
            cost_units: 0,
        });
        self.assigned = Some(instance_id);
        index
    }

    /// Finalize the in-flight attempt. No-op when none is running.
    pub fn finish_attempt(
        &mut self,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
        error: Option<String>,
        cost_units: u64,
        finished_at_ms: u64,
    ) {
        if let Some(attempt) = self.attempts.last_mut() {
            if attempt.finished_at_ms.is_none() {
                attempt.finished_at_ms = Some(finished_at_ms);
                attempt.outcome = outcome;
                attempt.error_kind = error_kind;
                attempt.error = error;
                attempt.cost_units = cost_units;
                self.cost_observed = self.cost_observed.saturating_add(cost_units);
            }
        }
        if outcome != AttemptOutcome::Running {
            self.assigned = None;
        }
    }

    /// Count of attempts made on the given runtime kind.
    pub fn attempts_on(&self, kind: RuntimeKind) -> u32 {
        self.attempts.iter().filter(|a| a.runtime_kind == kind).count() as u32
    }
}

crate::builder! {
    pub struct TaskSpecBuilder => TaskSpec {
        into {
            tenant: String = "tenant-a",
            correlation_id: String = "",
        }
        set {
            payload: serde_json::Value = serde_json::Value::Null,
            priority: Priority = Priority::Normal,
            required_capabilities: Vec<String> = Vec::new(),
            retry: RetryPolicy = RetryPolicy::default(),
            cost_estimate: u64 = 0,
            budget_ceiling: u64 = 0,
            budget_override: bool = false,
        }
        option {
            deadline_ms: u64 = None,
            preferred_region: String = None,
            max_latency_ms: u64 = None,
            workspace: String = None,
        }
    }
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
