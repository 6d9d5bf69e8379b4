// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted provider for tests: records calls, replays queued outcomes.

use crate::stream::{exec_stream_channel, ExecStream, StreamEvent};
use crate::{ExecOptions, ExecOutcome, ProviderError, RuntimeProvider, SpawnConfig};
use async_trait::async_trait;
use fm_core::{HealthStatus, ProviderCaps, RuntimeKind, SessionId};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Spawn { label: String },
    Execute { session: SessionId, command: String },
    HealthCheck { session: SessionId },
    Destroy { session: SessionId },
}

#[derive(Default)]
struct FakeState {
    spawn_errors: VecDeque<ProviderError>,
    exec_results: VecDeque<Result<ExecOutcome, ProviderError>>,
    /// Simulated execution latency; lets tests observe Running tasks
    exec_delay: Option<std::time::Duration>,
    health: Option<HealthStatus>,
    calls: Vec<FakeCall>,
    sessions: HashSet<SessionId>,
    destroyed: Vec<SessionId>,
}

/// Provider whose behavior is scripted per test.
///
/// Queued spawn errors are consumed first; once drained, spawns succeed.
/// Queued exec results are consumed in order; once drained, executions
/// succeed with [`FakeProvider::default_outcome`].
#[derive(Clone)]
pub struct FakeProvider {
    kind: RuntimeKind,
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvider {
    pub fn new(kind: RuntimeKind) -> Self {
        Self { kind, state: Arc::new(Mutex::new(FakeState::default())) }
    }

    pub fn default_outcome() -> ExecOutcome {
        ExecOutcome {
            stdout: "ok".into(),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 10,
            cost_units: 1,
        }
    }

    /// Queue a spawn failure; consumed before successful spawns.
    pub fn push_spawn_error(&self, error: ProviderError) {
        self.state.lock().spawn_errors.push_back(error);
    }

    /// Queue an execution result.
    pub fn push_exec(&self, result: Result<ExecOutcome, ProviderError>) {
        self.state.lock().exec_results.push_back(result);
    }

    /// Fix the reported session health.
    pub fn set_health(&self, health: HealthStatus) {
        self.state.lock().health = Some(health);
    }

    /// Make executions take this long (cancellable sleep).
    pub fn set_exec_delay(&self, delay: std::time::Duration) {
        self.state.lock().exec_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state.lock().calls.clone()
    }

    pub fn destroyed(&self) -> Vec<SessionId> {
        self.state.lock().destroyed.clone()
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

#[async_trait]
impl RuntimeProvider for FakeProvider {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    fn capabilities(&self) -> ProviderCaps {
        ProviderCaps {
            network_isolation: true,
            fs_isolation: true,
            snapshot: false,
            resource_limits: true,
            streaming_io: true,
        }
    }

    async fn spawn(&self, config: SpawnConfig) -> Result<SessionId, ProviderError> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::Spawn { label: config.label });
        if let Some(error) = state.spawn_errors.pop_front() {
            return Err(error);
        }
        let session_id = SessionId::new();
        state.sessions.insert(session_id);
        Ok(session_id)
    }

    async fn execute(
        &self,
        session: &SessionId,
        command: &str,
        _options: ExecOptions,
    ) -> Result<ExecOutcome, ProviderError> {
        let delay = {
            let mut state = self.state.lock();
            state
                .calls
                .push(FakeCall::Execute { session: *session, command: command.to_string() });
            if !state.sessions.contains(session) {
                return Err(ProviderError::SessionNotFound(session.to_string()));
            }
            state.exec_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().exec_results.pop_front().unwrap_or_else(|| Ok(Self::default_outcome()))
    }

    async fn execute_stream(
        &self,
        session: &SessionId,
        command: &str,
    ) -> Result<ExecStream, ProviderError> {
        let outcome = self.execute(session, command, ExecOptions::default()).await?;
        let (tx, _cancel, stream) = exec_stream_channel();
        tokio::spawn(async move {
            let _ = tx.send(StreamEvent::Stdout(outcome.stdout.into_bytes())).await;
            let _ = tx.send(StreamEvent::Exited(outcome.exit_code)).await;
        });
        Ok(stream)
    }

    async fn health_check(&self, session: &SessionId) -> Result<HealthStatus, ProviderError> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::HealthCheck { session: *session });
        if let Some(health) = state.health {
            return Ok(health);
        }
        Ok(if state.sessions.contains(session) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        })
    }

    async fn destroy(&self, session: &SessionId) -> Result<(), ProviderError> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::Destroy { session: *session });
        state.sessions.remove(session);
        state.destroyed.push(*session);
        Ok(())
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
