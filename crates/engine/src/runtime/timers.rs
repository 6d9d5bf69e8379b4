// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Timer firing: deadlines, grace windows, probe cycles, resets.

use crate::error::EngineError;
use crate::runtime::Runtime;
use crate::scheduler::TimerKind;
use fm_core::{Clock, ErrorKind, Event, InstanceId, TaskFailure, TaskId, TaskState};
use fm_storage::Checkpoint;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{info, warn};

impl<C: Clock> Runtime<C> {
    /// Fire every due timer. Returns the number fired.
    pub(crate) async fn fire_due_timers(&self) -> Result<usize, EngineError> {
        let fired = { self.scheduler.lock().fired_timers(self.clock.now()) };
        let count = fired.len();
        for kind in fired {
            match kind {
                TimerKind::TaskDeadline(task_id) => self.on_deadline(&task_id)?,
                TimerKind::CancelGrace(task_id) => self.on_cancel_grace(&task_id)?,
                TimerKind::ProbeCycle => self.on_probe_cycle().await?,
                TimerKind::BudgetReset => {
                    self.budgets.maybe_reset(&self.clock)?;
                    self.scheduler.lock().set_timer(
                        TimerKind::BudgetReset,
                        Duration::from_secs(60),
                        self.clock.now(),
                    );
                }
                TimerKind::RouteCooldown(task_id) => self.on_route_cooldown(&task_id),
                TimerKind::DrainDeadline(instance_id) => self.on_drain_deadline(&instance_id)?,
                TimerKind::CheckpointTick => {
                    self.on_checkpoint()?;
                    self.scheduler.lock().set_timer(
                        TimerKind::CheckpointTick,
                        Duration::from_secs(300),
                        self.clock.now(),
                    );
                }
            }
        }
        Ok(count)
    }

    /// Deadline reached: running tasks time out, waiting tasks fail with
    /// `DeadlineExceeded`.
    fn on_deadline(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let task = self.auditor.with_state(|state| state.get_task(task_id).cloned());
        let Some(mut task) = task else { return Ok(()) };
        if task.is_terminal() {
            return Ok(());
        }

        match task.state {
            TaskState::Running | TaskState::Dispatched => {
                // Instruct the provider to terminate the session.
                if let Some(control) = self.running.lock().get(task_id) {
                    control.cancel();
                }
                let from = task.state.to_string();
                let now_ms = self.clock.epoch_ms();
                task.finish_attempt(
                    fm_core::AttemptOutcome::Failed,
                    Some(ErrorKind::DeadlineExceeded),
                    Some("deadline exceeded".into()),
                    0,
                    now_ms,
                );
                task.state = TaskState::TimedOut;
                task.failure =
                    Some(TaskFailure::new(ErrorKind::DeadlineExceeded, "task deadline exceeded"));
                task.finished_at_ms = Some(now_ms);
                let event = Event::TaskTimedOut { id: task.id, tenant: task.spec.tenant.clone() };
                self.audit_task(&task, &from, "timed_out", None, vec![event])?;
                self.telemetry.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
                self.budgets.reconcile(
                    &task.spec.tenant,
                    task.spec.cost_estimate,
                    task.cost_observed,
                    &self.clock,
                )?;
                self.scheduler.lock().cancel_task_timers(task_id);
                self.running.lock().remove(task_id);
                info!(task = %task_id, "task timed out");
            }
            TaskState::Queued | TaskState::Admitted => {
                self.queues.lock().remove(task_id);
                self.running.lock().remove(task_id);
                let from = task.state.to_string();
                task.state = TaskState::Failed;
                task.failure = Some(TaskFailure::new(
                    ErrorKind::DeadlineExceeded,
                    "deadline passed before dispatch",
                ));
                task.finished_at_ms = Some(self.clock.epoch_ms());
                let event = Event::TaskFailed {
                    id: task.id,
                    tenant: task.spec.tenant.clone(),
                    kind: ErrorKind::DeadlineExceeded,
                    error: "deadline passed before dispatch".into(),
                };
                self.audit_task(&task, &from, "failed", None, vec![event])?;
                self.telemetry.tasks_failed.fetch_add(1, Ordering::Relaxed);
                self.scheduler.lock().cancel_task_timers(task_id);
            }
            _ => {}
        }
        Ok(())
    }

    /// The provider did not confirm cancellation within the grace window:
    /// the task is cancelled regardless and the instance gets an immediate
    /// health probe.
    fn on_cancel_grace(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let task = self.auditor.with_state(|state| state.get_task(task_id).cloned());
        let Some(task) = task else { return Ok(()) };
        if task.is_terminal() {
            return Ok(());
        }

        warn!(task = %task_id, "cancellation grace expired, forcing terminal state");
        let suspect = task
            .assigned
            .or_else(|| task.attempts.last().map(|a| a.instance_id));

        // Best-effort teardown of the session the driver failed to confirm.
        let control = self.running.lock().remove(task_id);
        if let Some(control) = control {
            if let Some((kind, session)) = control.current_session() {
                if let Some(provider) = self.providers.get(kind) {
                    tokio::spawn(async move {
                        let _ = provider.destroy(&session).await;
                    });
                }
            }
        }
        self.finalize_cancelled(task, "cancellation grace expired")?;

        if suspect.is_some() {
            // Flag the unresponsive instance for an immediate probe.
            self.scheduler.lock().set_timer(
                TimerKind::ProbeCycle,
                Duration::ZERO,
                self.clock.now(),
            );
        }
        Ok(())
    }

    /// Run one probe cycle immediately (also exposed for harness tests).
    pub async fn probe_now(&self) -> Result<(), EngineError> {
        self.on_probe_cycle().await
    }

    async fn on_probe_cycle(&self) -> Result<(), EngineError> {
        let to_remove = self.monitor.run_cycle(&self.registry, &self.clock).await?;
        for instance_id in to_remove {
            self.remove_instance_with_failover(&instance_id, "unhealthy past removal window")?;
        }
        self.scheduler.lock().set_timer(
            TimerKind::ProbeCycle,
            self.config.health.probe_interval,
            self.clock.now(),
        );
        Ok(())
    }

    fn on_route_cooldown(&self, task_id: &TaskId) {
        let ready = self.auditor.with_state(|state| {
            state
                .get_task(task_id)
                .filter(|t| t.state == TaskState::Admitted)
                .map(|t| (t.spec.tenant.clone(), t.spec.priority))
        });
        if let Some((tenant, priority)) = ready {
            self.queues.lock().push(&tenant, priority, *task_id);
            self.dispatch_pending();
        }
    }

    fn on_drain_deadline(&self, instance_id: &InstanceId) -> Result<(), EngineError> {
        self.remove_instance_with_failover(instance_id, "drain deadline expired")
    }

    /// Remove an instance and fail over whatever was running on it.
    pub(crate) fn remove_instance_with_failover(
        &self,
        instance_id: &InstanceId,
        reason: &str,
    ) -> Result<(), EngineError> {
        // In-flight drivers pick a new instance themselves.
        {
            let running = self.running.lock();
            for control in running.values() {
                control.mark_lost(instance_id);
            }
        }

        // Tasks assigned but without a live driver are failed over here.
        let stranded: Vec<TaskId> = self.auditor.with_state(|state| {
            state
                .tasks
                .values()
                .filter(|t| !t.is_terminal() && t.assigned == Some(*instance_id))
                .map(|t| t.id)
                .collect()
        });
        for task_id in stranded {
            self.fail_over_task(&task_id, reason)?;
        }

        self.registry.remove(instance_id, reason, &self.clock)?;
        self.scheduler.lock().cancel_timer(&TimerKind::DrainDeadline(*instance_id));
        Ok(())
    }

    /// Periodic checkpoint; truncates the audit log below the covered seq.
    pub(crate) fn on_checkpoint(&self) -> Result<(), EngineError> {
        let snapshot = self.auditor.with_state(|state| state.clone());
        let applied_seq = snapshot.applied_seq;
        Checkpoint::new(self.clock.epoch_ms(), snapshot).save(&self.checkpoint_path)?;
        let mut log = self.auditor.log().lock();
        log.flush()?;
        log.truncate_before(applied_seq + 1)?;
        info!(applied_seq, "checkpoint written");
        Ok(())
    }
}
