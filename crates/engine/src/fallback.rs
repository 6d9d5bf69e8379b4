// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fallback orchestrator: drives one task down its runtime-kind ladder.
//!
//! Each dispatched task gets a driver tokio task. The driver routes within
//! the current kind, executes through the circuit breakers, and walks the
//! ladder on transient failures. Durable mutations never happen here; the
//! driver reports progress to the engine loop as [`EngineMsg`]s.
//!
//! A task classified high-risk by tenant policy must not descend to a
//! weaker isolation kind; blocked rungs are skipped and reported.

use crate::breaker::{BreakerBoard, BreakerDecision};
use crate::registry::InstanceRegistry;
use crate::retry::sample_jitter;
use crate::router::{RouteDecision, RouteError, Router};
use fm_core::{
    AttemptOutcome, BreakerKey, Clock, ErrorKind, InstanceId, Policy, RetryClass, RuntimeKind,
    SessionId, Task, TaskId,
};
use fm_providers::{ExecOptions, ProviderRegistry, ResourceLimits, SpawnConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Progress reports from a driver to the engine loop.
#[derive(Debug)]
pub(crate) enum EngineMsg {
    /// Router picked an instance; a new attempt begins.
    Routed { task_id: TaskId, decision: RouteDecision },
    /// The session is up and the command is executing.
    AttemptStarted { task_id: TaskId, instance_id: InstanceId, kind: RuntimeKind },
    /// The in-flight attempt ended.
    AttemptFinished {
        task_id: TaskId,
        instance_id: InstanceId,
        kind: RuntimeKind,
        outcome: AttemptOutcome,
        error: Option<(ErrorKind, String)>,
        cost_units: u64,
    },
    /// Policy refused the descent to this kind.
    FallbackBlocked { task_id: TaskId, kind: RuntimeKind },
    /// The driver is done with this drive.
    Finalize { task_id: TaskId, result: DriveResult },
}

/// Terminal result of one drive down the ladder.
#[derive(Debug)]
pub(crate) enum DriveResult {
    Succeeded { stdout: String },
    Failed { kind: ErrorKind, message: String },
    Cancelled,
    /// No attempt was possible anywhere; re-queue after a cooldown.
    Deferred,
}

/// Cancellation surface shared between the loop and a driver.
///
/// `cancel` marks caller-initiated cancellation; `mark_lost` flags the
/// current attempt's instance as gone so the driver retries elsewhere
/// instead of finalizing as cancelled.
#[derive(Default)]
pub(crate) struct TaskControl {
    cancelled: AtomicBool,
    lost: AtomicBool,
    current_token: Mutex<CancellationToken>,
    current_instance: Mutex<Option<InstanceId>>,
    current_session: Mutex<Option<(RuntimeKind, SessionId)>>,
}

impl TaskControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.current_token.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Interrupt the current attempt if it is running on `instance`.
    pub fn mark_lost(&self, instance: &InstanceId) -> bool {
        let hit = self.current_instance.lock().as_ref() == Some(instance);
        if hit {
            self.lost.store(true, Ordering::Release);
            self.current_token.lock().cancel();
        }
        hit
    }

    /// Session of the in-flight attempt, for destroy-on-grace-expiry.
    pub fn current_session(&self) -> Option<(RuntimeKind, SessionId)> {
        *self.current_session.lock()
    }

    fn begin_attempt(&self, instance: InstanceId) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current_token.lock() = token.clone();
        *self.current_instance.lock() = Some(instance);
        token
    }

    fn end_attempt(&self) {
        *self.current_instance.lock() = None;
        *self.current_session.lock() = None;
    }

    fn take_lost(&self) -> bool {
        self.lost.swap(false, Ordering::AcqRel)
    }
}

/// Everything a driver needs, snapshot at dispatch time.
pub(crate) struct DriverCtx<C: Clock> {
    pub task: Task,
    pub ladder: Vec<RuntimeKind>,
    pub providers: Arc<ProviderRegistry>,
    pub policy: Arc<dyn Policy>,
    pub router: Arc<Router>,
    pub breakers: Arc<BreakerBoard>,
    pub registry: Arc<InstanceRegistry>,
    pub control: Arc<TaskControl>,
    pub affinity: Option<InstanceId>,
    pub max_instances: Option<u32>,
    pub clock: C,
    pub msg_tx: mpsc::Sender<EngineMsg>,
}

enum AttemptEnd {
    Success { stdout: String, cost_units: u64 },
    Failure { kind: ErrorKind, message: String, cost_units: u64 },
    Cancelled,
}

/// Run the ladder to completion and report the outcome.
pub(crate) async fn drive<C: Clock>(ctx: DriverCtx<C>) {
    let task_id = ctx.task.id;
    let result = drive_inner(&ctx).await;
    let _ = ctx.msg_tx.send(EngineMsg::Finalize { task_id, result }).await;
}

async fn drive_inner<C: Clock>(ctx: &DriverCtx<C>) -> DriveResult {
    let task = &ctx.task;
    let retry = task.spec.retry;
    let mut attempts_made = task.attempts.len() as u32;
    let attempts_at_start = attempts_made;

    for (rung, kind) in ctx.ladder.iter().copied().enumerate() {
        // Policy gate before each descent past the first rung.
        if rung > 0 && !ctx.policy.may_fallback_to(task, kind) {
            debug!(task = %task.id, %kind, "fallback blocked by policy");
            let _ = ctx
                .msg_tx
                .send(EngineMsg::FallbackBlocked { task_id: task.id, kind })
                .await;
            continue;
        }

        // Provider-wide breaker open means the whole rung is skipped.
        if ctx.breakers.is_open(&BreakerKey::provider(kind), &ctx.clock) {
            debug!(task = %task.id, %kind, "provider-wide breaker open, skipping rung");
            continue;
        }

        let Some(provider) = ctx.providers.get(kind) else {
            continue;
        };

        loop {
            if ctx.control.is_cancelled() {
                return DriveResult::Cancelled;
            }
            if !retry.allows_attempt(attempts_made) {
                return DriveResult::Failed {
                    kind: ErrorKind::AllProvidersExhausted,
                    message: format!("retry budget exhausted after {} attempts", attempts_made),
                };
            }

            // Route within this kind against a fresh membership snapshot.
            let instances = ctx.registry.snapshot();
            let occupied = ctx.registry.occupied_instances(&task.spec.tenant);
            let decision = match ctx.router.select(
                task,
                kind,
                &instances,
                &ctx.breakers,
                ctx.affinity,
                &occupied,
                ctx.max_instances,
                &ctx.clock,
            ) {
                Ok(decision) => decision,
                Err(RouteError::NoEligibleInstance) | Err(RouteError::FederationCapacity) => break,
            };

            attempts_made += 1;
            let instance_id = decision.instance_id;
            let _ = ctx
                .msg_tx
                .send(EngineMsg::Routed { task_id: task.id, decision })
                .await;

            let token = ctx.control.begin_attempt(instance_id);
            let end =
                run_attempt(ctx, provider.as_ref(), kind, instance_id, attempts_made, &token).await;
            ctx.control.end_attempt();

            match end {
                AttemptEnd::Success { stdout, cost_units } => {
                    let _ = ctx
                        .msg_tx
                        .send(EngineMsg::AttemptFinished {
                            task_id: task.id,
                            instance_id,
                            kind,
                            outcome: AttemptOutcome::Ok,
                            error: None,
                            cost_units,
                        })
                        .await;
                    return DriveResult::Succeeded { stdout };
                }
                AttemptEnd::Cancelled => {
                    if ctx.control.take_lost() {
                        // Instance disappeared under the attempt; the
                        // failure is transient, not a cancellation.
                        let _ = ctx
                            .msg_tx
                            .send(EngineMsg::AttemptFinished {
                                task_id: task.id,
                                instance_id,
                                kind,
                                outcome: AttemptOutcome::Failed,
                                error: Some((
                                    ErrorKind::TransientLocal,
                                    format!("instance {} lost mid-attempt", instance_id),
                                )),
                                cost_units: 0,
                            })
                            .await;
                        continue;
                    }
                    let _ = ctx
                        .msg_tx
                        .send(EngineMsg::AttemptFinished {
                            task_id: task.id,
                            instance_id,
                            kind,
                            outcome: AttemptOutcome::Cancelled,
                            error: Some((ErrorKind::Cancelled, "cancelled by caller".into())),
                            cost_units: 0,
                        })
                        .await;
                    return DriveResult::Cancelled;
                }
                AttemptEnd::Failure { kind: error_kind, message, cost_units } => {
                    warn!(task = %task.id, %kind, instance = %instance_id, %error_kind, "attempt failed");
                    let _ = ctx
                        .msg_tx
                        .send(EngineMsg::AttemptFinished {
                            task_id: task.id,
                            instance_id,
                            kind,
                            outcome: AttemptOutcome::Failed,
                            error: Some((error_kind, message.clone())),
                            cost_units,
                        })
                        .await;

                    match error_kind.retry_class() {
                        RetryClass::SameKind => {
                            let delay =
                                retry.delay_for(attempts_made + 1, sample_jitter(retry.jitter_pct));
                            if !delay.is_zero() {
                                let token = ctx.control.begin_attempt(instance_id);
                                tokio::select! {
                                    _ = token.cancelled() => {}
                                    _ = tokio::time::sleep(delay) => {}
                                }
                                ctx.control.end_attempt();
                            }
                            continue;
                        }
                        RetryClass::NextKind => break,
                        RetryClass::Cooldown => break,
                        RetryClass::Permanent => {
                            return DriveResult::Failed { kind: error_kind, message };
                        }
                    }
                }
            }
        }
    }

    if attempts_made == attempts_at_start {
        // Nothing was even attempted; park the task for a cooldown.
        DriveResult::Deferred
    } else {
        DriveResult::Failed {
            kind: ErrorKind::AllProvidersExhausted,
            message: format!("all runtime kinds exhausted after {} attempts", attempts_made),
        }
    }
}

/// One spawn + execute + destroy, behind the breakers, with cooperative
/// cancellation at every await point.
async fn run_attempt<C: Clock>(
    ctx: &DriverCtx<C>,
    provider: &dyn fm_providers::RuntimeProvider,
    kind: RuntimeKind,
    instance_id: InstanceId,
    attempt_index: u32,
    token: &CancellationToken,
) -> AttemptEnd {
    let task = &ctx.task;
    let provider_key = BreakerKey::provider(kind);
    let instance_key = BreakerKey::instance(kind, instance_id);

    // Consult both breaker keys; at most one HalfOpen probe proceeds.
    let provider_decision = ctx.breakers.admit(&provider_key, &ctx.clock);
    if provider_decision == BreakerDecision::Reject {
        return AttemptEnd::Failure {
            kind: ErrorKind::CircuitOpen,
            message: format!("breaker open for {}", provider_key),
            cost_units: 0,
        };
    }
    let instance_decision = ctx.breakers.admit(&instance_key, &ctx.clock);
    if instance_decision == BreakerDecision::Reject {
        if provider_decision == BreakerDecision::AllowProbe {
            ctx.breakers.release_probe(&provider_key);
        }
        return AttemptEnd::Failure {
            kind: ErrorKind::CircuitOpen,
            message: format!("breaker open for {}", instance_key),
            cost_units: 0,
        };
    }

    let release_probes = |breakers: &BreakerBoard| {
        if provider_decision == BreakerDecision::AllowProbe {
            breakers.release_probe(&provider_key);
        }
        if instance_decision == BreakerDecision::AllowProbe {
            breakers.release_probe(&instance_key);
        }
    };

    let payload = &task.spec.payload;
    let command = payload
        .get("command")
        .and_then(|v| v.as_str())
        .unwrap_or("true")
        .to_string();
    let spawn_config = SpawnConfig {
        label: task.id.to_string(),
        image: payload.get("image").and_then(|v| v.as_str()).map(String::from),
        env: payload
            .get("env")
            .and_then(|v| v.as_object())
            .map(|env| {
                env.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default(),
        limits: payload
            .get("limits")
            .and_then(|v| serde_json::from_value::<ResourceLimits>(v.clone()).ok())
            .unwrap_or_default(),
    };
    let options = ExecOptions {
        timeout: std::time::Duration::from_millis(task.spec.max_latency_ms.unwrap_or(300_000)),
        stdin: payload.get("stdin").and_then(|v| v.as_str()).map(String::from),
    };

    // Spawn.
    let session = tokio::select! {
        _ = token.cancelled() => {
            release_probes(&ctx.breakers);
            return AttemptEnd::Cancelled;
        }
        result = provider.spawn(spawn_config) => match result {
            Ok(session) => session,
            Err(error) => {
                ctx.breakers.record_failure(kind, instance_id, &ctx.clock);
                return AttemptEnd::Failure {
                    kind: error.error_kind(),
                    message: error.to_string(),
                    cost_units: 0,
                };
            }
        }
    };
    *ctx.control.current_session.lock() = Some((kind, session));

    let _ = ctx
        .msg_tx
        .send(EngineMsg::AttemptStarted { task_id: task.id, instance_id, kind })
        .await;
    debug!(task = %task.id, attempt = attempt_index, session = %session, "attempt executing");

    // Execute.
    let result = tokio::select! {
        _ = token.cancelled() => {
            let _ = provider.destroy(&session).await;
            release_probes(&ctx.breakers);
            return AttemptEnd::Cancelled;
        }
        result = provider.execute(&session, &command, options) => result,
    };
    let _ = provider.destroy(&session).await;

    match result {
        Ok(outcome) if outcome.exit_code == 0 => {
            ctx.breakers.record_success(kind, instance_id, &ctx.clock);
            AttemptEnd::Success { stdout: outcome.stdout, cost_units: outcome.cost_units }
        }
        Ok(outcome) => {
            // The work itself failed; the transport is fine.
            ctx.breakers.record_success(kind, instance_id, &ctx.clock);
            AttemptEnd::Failure {
                kind: ErrorKind::PermanentProvider,
                message: format!("command exited with code {}", outcome.exit_code),
                cost_units: outcome.cost_units,
            }
        }
        Err(error) => {
            ctx.breakers.record_failure(kind, instance_id, &ctx.clock);
            AttemptEnd::Failure { kind: error.error_kind(), message: error.to_string(), cost_units: 0 }
        }
    }
}

#[cfg(test)]
#[path = "fallback_tests.rs"]
mod tests;
