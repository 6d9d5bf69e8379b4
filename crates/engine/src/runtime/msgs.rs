// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine-loop handling of driver progress messages.
//!
//! All durable task/attempt mutations happen here, single-threaded, so the
//! audit stream observes transitions in the order drivers produced them.

use crate::error::EngineError;
use crate::fallback::{DriveResult, EngineMsg};
use crate::retry::CAPACITY_COOLDOWN;
use crate::router::RouteDecision;
use crate::runtime::Runtime;
use crate::scheduler::TimerKind;
use fm_core::{
    AttemptOutcome, AuditEntry, Clock, EntityKind, ErrorKind, Event, InstanceId, RuntimeKind,
    TaskFailure, TaskId, TaskState,
};
use fm_storage::AttemptRecord;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

impl<C: Clock> Runtime<C> {
    pub(crate) async fn handle_msg(&self, msg: EngineMsg) -> Result<(), EngineError> {
        match msg {
            EngineMsg::Routed { task_id, decision } => self.on_routed(&task_id, decision),
            EngineMsg::AttemptStarted { task_id, instance_id, kind } => {
                self.on_attempt_started(&task_id, &instance_id, kind)
            }
            EngineMsg::AttemptFinished { task_id, instance_id, kind, outcome, error, cost_units } => {
                self.on_attempt_finished(&task_id, &instance_id, kind, outcome, error, cost_units)
            }
            EngineMsg::FallbackBlocked { task_id, kind } => {
                let tenant = self
                    .auditor
                    .with_state(|state| state.get_task(&task_id).map(|t| t.spec.tenant.clone()));
                if let Some(tenant) = tenant {
                    self.auditor.publish(Event::TaskFallbackBlocked {
                        id: task_id,
                        tenant,
                        runtime_kind: kind,
                    });
                }
                Ok(())
            }
            EngineMsg::Finalize { task_id, result } => self.on_finalize(&task_id, result),
        }
    }

    fn on_routed(&self, task_id: &TaskId, decision: RouteDecision) -> Result<(), EngineError> {
        let task = self.auditor.with_state(|state| state.get_task(task_id).cloned());
        let Some(mut task) = task else { return Ok(()) };
        if task.is_terminal() {
            return Ok(());
        }

        let now_ms = self.clock.epoch_ms();
        let from = task.state.to_string();
        if task.state == TaskState::Admitted {
            task.state = TaskState::Dispatched;
        }
        task.push_attempt(decision.instance_id, decision.runtime_kind, now_ms);

        if let Some(admitted_at) = task.admitted_at_ms {
            self.telemetry
                .admission_to_dispatch
                .record_ms(now_ms.saturating_sub(admitted_at));
        }
        self.telemetry.attempts.fetch_add(1, Ordering::Relaxed);

        if let Some(workspace) = &task.spec.workspace {
            self.affinity.lock().insert(workspace.clone(), decision.instance_id);
        }

        let event = Event::TaskRouted {
            id: task.id,
            tenant: task.spec.tenant.clone(),
            instance_id: decision.instance_id,
            runtime_kind: decision.runtime_kind,
            score_milli: decision.score_milli,
            alternatives: decision.alternatives,
        };
        self.audit_task(&task, &from, "dispatched", None, vec![event])?;
        Ok(())
    }

    fn on_attempt_started(
        &self,
        task_id: &TaskId,
        instance_id: &InstanceId,
        _kind: RuntimeKind,
    ) -> Result<(), EngineError> {
        let task = self.auditor.with_state(|state| state.get_task(task_id).cloned());
        let Some(mut task) = task else { return Ok(()) };
        if task.is_terminal() || task.state != TaskState::Dispatched {
            return Ok(());
        }

        let now_ms = self.clock.epoch_ms();
        task.state = TaskState::Running;
        if let Some(attempt) = task.attempts.last() {
            self.telemetry
                .dispatch_to_start
                .record_ms(now_ms.saturating_sub(attempt.started_at_ms));
        }

        let event = Event::TaskStarted {
            id: task.id,
            tenant: task.spec.tenant.clone(),
            instance_id: *instance_id,
            attempt: task.attempts.len() as u32,
        };
        self.audit_task(&task, "dispatched", "running", None, vec![event])?;
        Ok(())
    }

    fn on_attempt_finished(
        &self,
        task_id: &TaskId,
        instance_id: &InstanceId,
        kind: RuntimeKind,
        outcome: AttemptOutcome,
        error: Option<(ErrorKind, String)>,
        cost_units: u64,
    ) -> Result<(), EngineError> {
        let task = self.auditor.with_state(|state| state.get_task(task_id).cloned());
        let Some(mut task) = task else { return Ok(()) };
        if task.is_terminal() {
            return Ok(());
        }

        let now_ms = self.clock.epoch_ms();
        let (error_kind, error_message) = match &error {
            Some((kind, message)) => (Some(*kind), Some(message.clone())),
            None => (None, None),
        };
        task.finish_attempt(outcome, error_kind, error_message.clone(), cost_units, now_ms);

        if let Some(attempt) = task.attempts.last() {
            self.telemetry
                .attempt_duration
                .record_ms(now_ms.saturating_sub(attempt.started_at_ms));

            // The finalized attempt is its own durable record.
            let record = AttemptRecord { task_id: task.id.to_string(), attempt: attempt.clone() };
            let entry = AuditEntry::new(
                now_ms,
                EntityKind::Attempt,
                format!("{}/{}", task.id, attempt.index),
                "running",
                attempt.outcome.to_string(),
                "lifecycle",
                None,
                serde_json::to_value(&record).map_err(fm_storage::AuditError::from)?,
            );
            self.auditor.record(entry, vec![])?;
        }

        // Transient failures put the task back in Dispatched for the next
        // attempt; the terminal decision arrives with Finalize.
        if outcome == AttemptOutcome::Failed && task.state == TaskState::Running {
            let from = task.state.to_string();
            task.state = TaskState::Dispatched;
            let event = error.map(|(error_kind, message)| Event::TaskAttemptFailed {
                id: task.id,
                tenant: task.spec.tenant.clone(),
                instance_id: *instance_id,
                runtime_kind: kind,
                attempt: task.attempts.len() as u32,
                kind: error_kind,
                error: message,
            });
            self.audit_task(&task, &from, "dispatched", None, event.into_iter().collect())?;
        } else {
            // Success/cancel paths still record the task snapshot so the
            // attempt list stays consistent on replay.
            let state_label = task.state.to_string();
            let event = error.map(|(error_kind, message)| Event::TaskAttemptFailed {
                id: task.id,
                tenant: task.spec.tenant.clone(),
                instance_id: *instance_id,
                runtime_kind: kind,
                attempt: task.attempts.len() as u32,
                kind: error_kind,
                error: message,
            });
            self.audit_task(&task, &state_label, &state_label, None, event.into_iter().collect())?;
        }
        Ok(())
    }

    fn on_finalize(&self, task_id: &TaskId, result: DriveResult) -> Result<(), EngineError> {
        let task = self.auditor.with_state(|state| state.get_task(task_id).cloned());
        let Some(mut task) = task else {
            self.running.lock().remove(task_id);
            return Ok(());
        };

        // Terminal states are absorbing: a late driver result (e.g. after a
        // grace-window force-cancel or deadline) is dropped.
        if task.is_terminal() {
            self.running.lock().remove(task_id);
            return Ok(());
        }

        let now_ms = self.clock.epoch_ms();
        match result {
            DriveResult::Succeeded { stdout: _ } => {
                let from = task.state.to_string();
                task.state = TaskState::Succeeded;
                task.finished_at_ms = Some(now_ms);
                let event = Event::TaskCompleted {
                    id: task.id,
                    tenant: task.spec.tenant.clone(),
                    cost_units: task.cost_observed,
                };
                self.audit_task(&task, &from, "succeeded", None, vec![event])?;
                self.telemetry.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
                self.telemetry.end_to_end.record_ms(now_ms.saturating_sub(task.created_at_ms));
                self.budgets.reconcile(
                    &task.spec.tenant,
                    task.spec.cost_estimate,
                    task.cost_observed,
                    &self.clock,
                )?;
                self.finish_bookkeeping(task_id);
                debug!(task = %task_id, "task succeeded");
            }
            DriveResult::Failed { kind, message } => {
                let from = task.state.to_string();
                task.state = TaskState::Failed;
                task.failure = Some(TaskFailure::new(kind, message.clone()));
                task.finished_at_ms = Some(now_ms);
                let event = Event::TaskFailed {
                    id: task.id,
                    tenant: task.spec.tenant.clone(),
                    kind,
                    error: message,
                };
                self.audit_task(&task, &from, "failed", None, vec![event])?;
                self.telemetry.tasks_failed.fetch_add(1, Ordering::Relaxed);
                self.budgets.reconcile(
                    &task.spec.tenant,
                    task.spec.cost_estimate,
                    task.cost_observed,
                    &self.clock,
                )?;
                self.finish_bookkeeping(task_id);
                warn!(task = %task_id, %kind, "task failed");
            }
            DriveResult::Cancelled => {
                self.running.lock().remove(task_id);
                self.finalize_cancelled(task, "cancelled while running")?;
            }
            DriveResult::Deferred => {
                // Nothing was attempted anywhere; retry after a cooldown.
                self.running.lock().remove(task_id);
                self.scheduler.lock().set_timer(
                    TimerKind::RouteCooldown(*task_id),
                    CAPACITY_COOLDOWN,
                    self.clock.now(),
                );
                debug!(task = %task_id, "no eligible instance, deferred");
            }
        }
        Ok(())
    }

    fn finish_bookkeeping(&self, task_id: &TaskId) {
        self.scheduler.lock().cancel_task_timers(task_id);
        self.running.lock().remove(task_id);
    }
}
