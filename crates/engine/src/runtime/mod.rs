// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime: wires the federation core together.
//!
//! The runtime owns the dispatch queues, the running-task table, and the
//! engine-loop plumbing. Durable state lives in the shared store behind the
//! auditor; drivers report progress over an mpsc channel and the loop
//! applies every durable mutation single-threaded.

mod api;
mod msgs;
mod timers;

use crate::audit::Auditor;
use crate::breaker::BreakerBoard;
use crate::budget::BudgetGate;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fallback::{self, DriverCtx, EngineMsg, TaskControl};
use crate::health::{HealthMonitor, Prober};
use crate::queues::DispatchQueues;
use crate::registry::InstanceRegistry;
use crate::router::Router;
use crate::scheduler::{Scheduler, TimerKind};
use fm_core::{
    Clock, ErrorKind, Event, EventSink, HealthStatus, InstanceId, Policy, TaskFailure, TaskId,
    TaskState, Telemetry, TelemetrySnapshot,
};
use fm_providers::ProviderRegistry;
use fm_storage::{AuditLog, MaterializedState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Engine-loop channel depth; drivers apply backpressure past this.
const MSG_CHANNEL_CAPACITY: usize = 256;

/// External collaborators handed to the runtime at startup.
pub struct RuntimeDeps {
    pub providers: Arc<ProviderRegistry>,
    pub policy: Arc<dyn Policy>,
    pub prober: Arc<dyn Prober>,
    pub sink: Arc<dyn EventSink>,
    pub log: Arc<Mutex<AuditLog>>,
    pub state: Arc<Mutex<MaterializedState>>,
    pub telemetry: Arc<Telemetry>,
    /// Where periodic checkpoints and pre-rollback checkpoints land
    pub checkpoint_path: PathBuf,
}

/// Point-in-time summary for the status surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSummary {
    pub instances_total: usize,
    pub instances_healthy: usize,
    pub instances_degraded: usize,
    pub instances_unhealthy: usize,
    pub utilization: f64,
    pub queued_tasks: usize,
    pub active_tasks: usize,
    pub telemetry: TelemetrySnapshot,
}

/// The federation core.
pub struct Runtime<C: Clock> {
    pub(crate) config: EngineConfig,
    pub(crate) clock: C,
    pub(crate) auditor: Auditor,
    pub(crate) providers: Arc<ProviderRegistry>,
    pub(crate) policy: Arc<dyn Policy>,
    pub(crate) router: Arc<Router>,
    pub(crate) registry: Arc<InstanceRegistry>,
    pub(crate) breakers: Arc<BreakerBoard>,
    pub(crate) budgets: BudgetGate,
    pub(crate) monitor: HealthMonitor,
    pub(crate) queues: Mutex<DispatchQueues>,
    pub(crate) scheduler: Mutex<Scheduler>,
    pub(crate) telemetry: Arc<Telemetry>,
    pub(crate) running: Mutex<HashMap<TaskId, Arc<TaskControl>>>,
    /// workspace → instance that served it last (affinity)
    pub(crate) affinity: Mutex<HashMap<String, InstanceId>>,
    pub(crate) checkpoint_path: PathBuf,
    pub(crate) msg_tx: mpsc::Sender<EngineMsg>,
    msg_rx: tokio::sync::Mutex<mpsc::Receiver<EngineMsg>>,
    pub(crate) shutting_down: AtomicBool,
}

impl<C: Clock> Runtime<C> {
    pub fn new(deps: RuntimeDeps, config: EngineConfig, clock: C) -> Self {
        let auditor = Auditor::new(deps.log, deps.state, deps.sink);
        let (msg_tx, msg_rx) = mpsc::channel(MSG_CHANNEL_CAPACITY);

        let runtime = Self {
            router: Arc::new(Router::new(config.router.clone())),
            registry: Arc::new(InstanceRegistry::new(auditor.clone())),
            breakers: Arc::new(BreakerBoard::new(config.breaker.clone(), auditor.clone())),
            budgets: BudgetGate::new(config.budget.clone(), auditor.clone()),
            monitor: HealthMonitor::new(config.health.clone(), auditor.clone(), deps.prober),
            config,
            clock,
            auditor,
            providers: deps.providers,
            policy: deps.policy,
            queues: Mutex::new(DispatchQueues::new()),
            scheduler: Mutex::new(Scheduler::new()),
            telemetry: deps.telemetry,
            running: Mutex::new(HashMap::new()),
            affinity: Mutex::new(HashMap::new()),
            checkpoint_path: deps.checkpoint_path,
            msg_tx,
            msg_rx: tokio::sync::Mutex::new(msg_rx),
            shutting_down: AtomicBool::new(false),
        };
        runtime.schedule_periodic();
        runtime
    }

    fn schedule_periodic(&self) {
        let now = self.clock.now();
        let mut scheduler = self.scheduler.lock();
        scheduler.set_timer(TimerKind::ProbeCycle, self.config.health.probe_interval, now);
        scheduler.set_timer(TimerKind::BudgetReset, std::time::Duration::from_secs(60), now);
        scheduler.set_timer(TimerKind::CheckpointTick, std::time::Duration::from_secs(300), now);
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    pub fn budgets(&self) -> &BudgetGate {
        &self.budgets
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Recovery pass after state replay: rebuild indexes and fail over
    /// tasks that were in flight when the process died.
    pub fn recover(&self) -> Result<usize, EngineError> {
        self.registry.rebuild_index();
        self.budgets.load_from_state();

        let orphans: Vec<TaskId> = self.auditor.with_state(|state| {
            state
                .tasks
                .values()
                .filter(|t| matches!(t.state, TaskState::Dispatched | TaskState::Running))
                .map(|t| t.id)
                .collect()
        });

        for task_id in &orphans {
            self.fail_over_task(task_id, "session lost across restart")?;
        }

        // Queued/Admitted tasks resume dispatch.
        let queued: Vec<(String, fm_core::Priority, TaskId)> = self.auditor.with_state(|state| {
            state
                .tasks
                .values()
                .filter(|t| matches!(t.state, TaskState::Queued | TaskState::Admitted))
                .map(|t| (t.spec.tenant.clone(), t.spec.priority, t.id))
                .collect()
        });
        let resumed = queued.len() + orphans.len();
        {
            let mut queues = self.queues.lock();
            for (tenant, priority, task_id) in queued {
                queues.push(&tenant, priority, task_id);
            }
        }
        self.dispatch_pending();

        if resumed > 0 {
            info!(resumed, "recovery requeued in-flight work");
        }
        Ok(resumed)
    }

    /// Redispatch a task whose instance disappeared, honoring its retry
    /// policy; no-op for terminal or unknown tasks.
    pub(crate) fn fail_over_task(&self, task_id: &TaskId, reason: &str) -> Result<(), EngineError> {
        let task = self.auditor.with_state(|state| state.get_task(task_id).cloned());
        let Some(mut task) = task else {
            return Ok(());
        };
        if task.is_terminal() {
            return Ok(());
        }

        // An in-flight driver handles its own failover via mark_lost.
        if self.running.lock().contains_key(task_id) {
            return Ok(());
        }

        let now_ms = self.clock.epoch_ms();
        let from = task.state.to_string();
        task.finish_attempt(
            fm_core::AttemptOutcome::Failed,
            Some(ErrorKind::TransientLocal),
            Some(reason.to_string()),
            0,
            now_ms,
        );

        if task.spec.retry.allows_attempt(task.attempts.len() as u32) {
            task.state = TaskState::Admitted;
            self.audit_task(&task, &from, "admitted", Some(reason.to_string()), vec![])?;
            self.queues.lock().push(&task.spec.tenant, task.spec.priority, task.id);
            self.dispatch_pending();
        } else {
            task.state = TaskState::Failed;
            task.failure = Some(TaskFailure::new(
                ErrorKind::AllProvidersExhausted,
                format!("instance lost and retry budget exhausted: {}", reason),
            ));
            task.finished_at_ms = Some(now_ms);
            let event = Event::TaskFailed {
                id: task.id,
                tenant: task.spec.tenant.clone(),
                kind: ErrorKind::AllProvidersExhausted,
                error: "instance lost".into(),
            };
            self.audit_task(&task, &from, "failed", Some(reason.to_string()), vec![event])?;
            self.telemetry.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Pop ready tasks and spawn a driver for each.
    pub(crate) fn dispatch_pending(&self) {
        loop {
            let task_id = { self.queues.lock().pop() };
            let Some(task_id) = task_id else { break };
            if let Err(e) = self.spawn_driver(&task_id) {
                warn!(task = %task_id, error = %e, "dispatch failed");
            }
        }
    }

    fn spawn_driver(&self, task_id: &TaskId) -> Result<(), EngineError> {
        let task = self.auditor.with_state(|state| state.get_task(task_id).cloned());
        let Some(task) = task else { return Ok(()) };
        if task.is_terminal() || task.state != TaskState::Admitted {
            return Ok(());
        }
        // A driver may already own this task (e.g. requeued during recovery).
        if self.running.lock().contains_key(&task.id) {
            return Ok(());
        }

        let ladder = self.policy.allowed_runtime_kinds(&task.spec.tenant, &task);
        if ladder.is_empty() {
            return self.finalize_rejection(
                task,
                ErrorKind::PolicyDenied,
                "no runtime kind permitted by policy".into(),
            );
        }

        let control = TaskControl::new();
        self.running.lock().insert(task.id, Arc::clone(&control));

        let affinity = task
            .spec
            .workspace
            .as_ref()
            .and_then(|workspace| self.affinity.lock().get(workspace).copied());
        let max_instances =
            self.budgets.quota(&task.spec.tenant).map(|quota| quota.max_instances);

        let ctx = DriverCtx {
            task,
            ladder,
            providers: Arc::clone(&self.providers),
            policy: Arc::clone(&self.policy),
            router: Arc::clone(&self.router),
            breakers: Arc::clone(&self.breakers),
            registry: Arc::clone(&self.registry),
            control,
            affinity,
            max_instances,
            clock: self.clock.clone(),
            msg_tx: self.msg_tx.clone(),
        };
        tokio::spawn(fallback::drive(ctx));
        Ok(())
    }

    /// Process all pending driver messages and due timers.
    ///
    /// Returns the number of items handled; used by tests and by the daemon
    /// loop between waits.
    pub async fn run_pending(&self) -> Result<usize, EngineError> {
        let mut handled = 0;
        loop {
            let msg = { self.msg_rx.lock().await.try_recv().ok() };
            match msg {
                Some(msg) => {
                    self.handle_msg(msg).await?;
                    handled += 1;
                }
                None => break,
            }
        }
        handled += self.fire_due_timers().await?;
        self.auditor.maybe_flush()?;
        Ok(handled)
    }

    /// Block until the next message or timer deadline, then process it.
    pub async fn run_once(&self) -> Result<(), EngineError> {
        let deadline = { self.scheduler.lock().next_deadline() };
        let sleep_until = deadline
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + std::time::Duration::from_secs(3600));

        let msg = {
            let mut rx = self.msg_rx.lock().await;
            tokio::select! {
                msg = rx.recv() => msg,
                _ = tokio::time::sleep_until(sleep_until) => None,
            }
        };

        if let Some(msg) = msg {
            self.handle_msg(msg).await?;
        } else {
            self.fire_due_timers().await?;
        }
        self.auditor.maybe_flush()?;
        Ok(())
    }

    /// Wait until no drivers are running and no work is queued. Test glue.
    pub async fn settle(&self) -> Result<(), EngineError> {
        loop {
            self.run_pending().await?;
            let idle = self.running.lock().is_empty() && self.queues.lock().is_empty();
            if idle {
                // One more pass to drain messages sent while settling.
                if self.run_pending().await? == 0 {
                    return Ok(());
                }
                continue;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }

    /// Status for the introspection surface.
    pub fn status(&self) -> StatusSummary {
        let instances = self.registry.snapshot();
        let count = |status: HealthStatus| {
            instances.iter().filter(|i| i.health.status == status).count()
        };
        StatusSummary {
            instances_total: instances.len(),
            instances_healthy: count(HealthStatus::Healthy),
            instances_degraded: count(HealthStatus::Degraded),
            instances_unhealthy: count(HealthStatus::Unhealthy),
            utilization: Router::global_utilization(&instances),
            queued_tasks: self.queues.lock().len(),
            active_tasks: self.running.lock().len(),
            telemetry: self.telemetry.snapshot(),
        }
    }

    /// Stop accepting new tasks.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.auditor.publish(Event::Shutdown);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Tasks with an active driver.
    pub fn active_tasks(&self) -> Vec<TaskId> {
        self.running.lock().keys().copied().collect()
    }

    /// Queue depth for one (tenant, priority); a telemetry gauge.
    pub fn queue_depth(&self, tenant: &str, priority: fm_core::Priority) -> usize {
        self.queues.lock().depth(tenant, priority)
    }

    /// Flush buffered audit entries to disk.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.auditor.log().lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "../runtime_tests.rs"]
mod tests;
