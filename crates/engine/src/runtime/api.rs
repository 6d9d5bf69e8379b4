// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Public runtime API: the submission and worker-registration surfaces.

use crate::budget::AdmissionDecision;
use crate::error::EngineError;
use crate::router::Router;
use crate::runtime::Runtime;
use crate::scheduler::TimerKind;
use fm_core::{
    AuditEntry, Clock, EntityKind, ErrorKind, Event, Instance, InstanceConfig, InstanceId,
    LoadSnapshot, Task, TaskFailure, TaskId, TaskSpec, TaskState,
};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::info;

impl<C: Clock> Runtime<C> {
    /// Submit a task. Returns the task id on admission; a rejected task is
    /// persisted in its terminal `Failed` state and the failure returned.
    pub fn submit_task(&self, spec: TaskSpec) -> Result<TaskId, TaskFailure> {
        let task_id = TaskId::new();
        let now_ms = self.clock.epoch_ms();
        let task = Task::new(task_id, spec, now_ms);

        self.telemetry.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        let submitted = Event::TaskSubmitted {
            id: task.id,
            tenant: task.spec.tenant.clone(),
            priority: task.spec.priority,
            correlation_id: task.spec.correlation_id.clone(),
        };
        if self
            .audit_task(&task, "absent", "queued", None, vec![submitted])
            .is_err()
        {
            return Err(TaskFailure::new(ErrorKind::InvalidInput, "persistence unavailable"));
        }

        if self.is_shutting_down() {
            return self.reject(task, ErrorKind::FederationCapacity, "shutting down".into());
        }

        // Validation.
        if task.spec.tenant.is_empty() {
            return self.reject(task, ErrorKind::InvalidInput, "tenant must not be empty".into());
        }
        if task.spec.required_capabilities.iter().any(|cap| cap.is_empty()) {
            return self.reject(task, ErrorKind::InvalidInput, "empty capability tag".into());
        }
        if let Some(deadline) = task.spec.deadline_ms {
            if deadline <= now_ms {
                return self.reject(
                    task,
                    ErrorKind::InvalidInput,
                    format!("deadline {} is in the past", deadline),
                );
            }
        }

        // Global backpressure.
        let instances = self.registry.snapshot();
        if self.router.check_backpressure(&instances).is_err() {
            return self.reject(
                task,
                ErrorKind::FederationCapacity,
                format!(
                    "global utilization {:.2} at reject threshold",
                    Router::global_utilization(&instances)
                ),
            );
        }

        // Budget and quota gate, with reservation. The per-task ceiling is
        // checked first; the tenant window after.
        if task.spec.budget_ceiling > 0 && task.spec.cost_estimate > task.spec.budget_ceiling {
            let message = format!(
                "estimate {} exceeds task ceiling {}",
                task.spec.cost_estimate, task.spec.budget_ceiling
            );
            return self.reject(task, ErrorKind::BudgetExceeded, message);
        }
        let active = self
            .auditor
            .with_state(|state| state.active_task_count(&task.spec.tenant))
            .saturating_sub(1); // the task itself is already in state
        if let Err(AdmissionDecision { kind, message }) = self.budgets.admit(
            &task.spec.tenant,
            task.spec.cost_estimate,
            active,
            task.spec.budget_override,
            &self.clock,
        ) {
            return self.reject(task, kind, message);
        }

        // Admitted.
        let mut admitted = task;
        admitted.state = TaskState::Admitted;
        admitted.admitted_at_ms = Some(now_ms);
        let event = Event::TaskAdmitted { id: admitted.id, tenant: admitted.spec.tenant.clone() };
        if let Err(e) = self.audit_task(&admitted, "queued", "admitted", None, vec![event]) {
            tracing::error!(task = %admitted.id, error = %e, "admission audit failed");
            return Err(TaskFailure::new(ErrorKind::InvalidInput, "persistence unavailable"));
        }
        self.telemetry.tasks_admitted.fetch_add(1, Ordering::Relaxed);

        if let Some(deadline) = admitted.spec.deadline_ms {
            let wait = Duration::from_millis(deadline.saturating_sub(now_ms));
            self.scheduler.lock().set_timer(
                TimerKind::TaskDeadline(admitted.id),
                wait,
                self.clock.now(),
            );
        }

        self.queues
            .lock()
            .push(&admitted.spec.tenant, admitted.spec.priority, admitted.id);
        self.dispatch_pending();

        Ok(task_id)
    }

    /// Cancel a task. Idempotent: cancelling a terminal task is a no-op.
    pub fn cancel_task(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let task = self.auditor.with_state(|state| state.get_task(task_id).cloned());
        let Some(task) = task else {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        };
        if task.is_terminal() {
            return Ok(());
        }

        let control = self.running.lock().get(task_id).cloned();
        match control {
            Some(control) => {
                // A driver is active: cancellation is cooperative, bounded
                // by the grace window.
                control.cancel();
                self.scheduler.lock().set_timer(
                    TimerKind::CancelGrace(*task_id),
                    self.config.drain.cancel_grace,
                    self.clock.now(),
                );
            }
            None => {
                // Not yet dispatched (queued, admitted, or in cooldown).
                self.queues.lock().remove(task_id);
                self.finalize_cancelled(task, "cancelled before dispatch")?;
            }
        }
        Ok(())
    }

    /// Current task snapshot.
    pub fn get_task(&self, task_id: &TaskId) -> Option<Task> {
        self.auditor.with_state(|state| state.get_task(task_id).cloned())
    }

    /// Register a worker instance (idempotent by id).
    pub fn register_instance(&self, config: InstanceConfig) -> Result<InstanceId, EngineError> {
        let instance = self.registry.register(config, &self.clock)?;
        Ok(instance.id)
    }

    /// Record a worker heartbeat.
    pub fn heartbeat(
        &self,
        id: &InstanceId,
        load: LoadSnapshot,
        capabilities: Option<BTreeSet<String>>,
    ) -> Result<(), EngineError> {
        self.registry.heartbeat(id, load, capabilities, &self.clock)
    }

    /// Deregister: drain, then remove at the drain deadline.
    pub fn deregister_instance(&self, id: &InstanceId) -> Result<(), EngineError> {
        let deadline_ms =
            self.clock.epoch_ms() + self.config.drain.drain_deadline.as_millis() as u64;
        self.registry.begin_drain(id, deadline_ms, &self.clock)?;
        self.scheduler.lock().set_timer(
            TimerKind::DrainDeadline(*id),
            self.config.drain.drain_deadline,
            self.clock.now(),
        );
        Ok(())
    }

    /// List registered instances.
    pub fn instances(&self) -> Vec<Instance> {
        self.registry.snapshot()
    }

    /// Roll a durable entity back to its version at `target_seq`.
    pub fn rollback_entity(
        &self,
        entity: EntityKind,
        entity_id: &str,
        target_seq: u64,
    ) -> Result<Option<u64>, EngineError> {
        let mut log = self.auditor.log().lock();
        let mut state = self.auditor.state().lock();
        let seq = fm_storage::rollback(
            &mut log,
            &mut state,
            &self.checkpoint_path,
            entity,
            entity_id,
            target_seq,
            self.clock.epoch_ms(),
        )?;
        Ok(seq)
    }

    /// Range-scan audit entries for one entity.
    pub fn audit_entries(
        &self,
        entity: EntityKind,
        entity_id: &str,
        up_to: Option<u64>,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        let mut log = self.auditor.log().lock();
        Ok(log.entries_for(entity, entity_id, up_to)?)
    }

    /// Cancel every queued (not yet dispatched) task; shutdown path.
    pub fn cancel_queued_tasks(&self) -> Result<usize, EngineError> {
        let mut queued: Vec<Task> = self.auditor.with_state(|state| {
            state
                .tasks
                .values()
                .filter(|t| matches!(t.state, TaskState::Queued | TaskState::Admitted))
                .cloned()
                .collect()
        });
        {
            let running = self.running.lock();
            queued.retain(|t| !running.contains_key(&t.id));
        }
        let cancelled = queued.len();
        for task in queued {
            self.queues.lock().remove(&task.id);
            self.finalize_cancelled(task, "shutdown")?;
        }
        Ok(cancelled)
    }

    /// Ask every running driver to cancel; shutdown path.
    pub fn cancel_running_tasks(&self) {
        let controls: Vec<_> = self.running.lock().values().cloned().collect();
        for control in controls {
            control.cancel();
        }
    }

    // --- shared helpers -------------------------------------------------

    /// Persist a task snapshot transition and publish its events.
    pub(crate) fn audit_task(
        &self,
        task: &Task,
        from: &str,
        to: &str,
        reason: Option<String>,
        events: Vec<Event>,
    ) -> Result<u64, EngineError> {
        let entry = AuditEntry::new(
            self.clock.epoch_ms(),
            EntityKind::Task,
            task.id.as_str(),
            from,
            to,
            "lifecycle",
            reason,
            serde_json::to_value(task).map_err(fm_storage::AuditError::from)?,
        );
        self.auditor.record(entry, events)
    }

    /// Reject at admission: the task moves to terminal `Failed` and the
    /// caller gets the failure.
    fn reject(
        &self,
        mut task: Task,
        kind: ErrorKind,
        message: String,
    ) -> Result<TaskId, TaskFailure> {
        let failure = TaskFailure::new(kind, message.clone());
        let from = task.state.to_string();
        task.state = TaskState::Failed;
        task.failure = Some(failure.clone());
        task.finished_at_ms = Some(self.clock.epoch_ms());

        let event = Event::TaskRejected {
            id: task.id,
            tenant: task.spec.tenant.clone(),
            kind,
            reason: message,
        };
        if let Err(e) = self.audit_task(&task, &from, "failed", None, vec![event]) {
            tracing::error!(task = %task.id, error = %e, "rejection audit failed");
        }
        self.telemetry.incr_rejected(&kind.to_string());
        info!(task = %task.id, %kind, "task rejected at admission");
        Err(failure)
    }

    /// Used by spawn_driver when policy leaves no runtime kind.
    pub(crate) fn finalize_rejection(
        &self,
        mut task: Task,
        kind: ErrorKind,
        message: String,
    ) -> Result<(), EngineError> {
        let from = task.state.to_string();
        task.state = TaskState::Failed;
        task.failure = Some(TaskFailure::new(kind, message.clone()));
        task.finished_at_ms = Some(self.clock.epoch_ms());

        let event = Event::TaskFailed {
            id: task.id,
            tenant: task.spec.tenant.clone(),
            kind,
            error: message,
        };
        self.audit_task(&task, &from, "failed", None, vec![event])?;
        self.telemetry.tasks_failed.fetch_add(1, Ordering::Relaxed);
        self.scheduler.lock().cancel_task_timers(&task.id);
        Ok(())
    }

    /// Move a task to terminal `Cancelled` and clean up.
    pub(crate) fn finalize_cancelled(
        &self,
        mut task: Task,
        reason: &str,
    ) -> Result<(), EngineError> {
        let from = task.state.to_string();
        task.state = TaskState::Cancelled;
        task.failure = Some(TaskFailure::new(ErrorKind::Cancelled, reason.to_string()));
        task.finished_at_ms = Some(self.clock.epoch_ms());

        let event = Event::TaskCancelled { id: task.id, tenant: task.spec.tenant.clone() };
        self.audit_task(&task, &from, "cancelled", Some(reason.to_string()), vec![event])?;
        self.telemetry.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
        self.budgets.reconcile(
            &task.spec.tenant,
            task.spec.cost_estimate,
            task.cost_observed,
            &self.clock,
        )?;
        self.scheduler.lock().cancel_task_timers(&task.id);
        self.running.lock().remove(&task.id);
        Ok(())
    }
}
