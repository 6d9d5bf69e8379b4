// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote sandbox: execution delegated to an external service over
//! bearer-authenticated HTTP RPC.
//!
//! Capabilities depend on the service; they are declared at construction
//! rather than probed. 5xx responses and connection failures classify as
//! transient-remote, 4xx as permanent.

use crate::http;
use crate::stream::{exec_stream_channel, ExecStream, StreamEvent};
use crate::{ExecOptions, ExecOutcome, ProviderError, RuntimeProvider, SpawnConfig};
use async_trait::async_trait;
use fm_core::{HealthStatus, ProviderCaps, RuntimeKind, SessionId};
use serde::Deserialize;
use tracing::debug;

/// Remote service client implementing the provider surface.
pub struct RemoteSandbox {
    addr: String,
    auth_token: String,
    caps: ProviderCaps,
}

#[derive(Deserialize)]
struct RemoteExecResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i32,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    cost_units: u64,
}

#[derive(Deserialize)]
struct RemoteHealthResponse {
    status: fm_core::HealthStatus,
}

impl RemoteSandbox {
    pub fn new(addr: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            auth_token: auth_token.into(),
            caps: ProviderCaps {
                network_isolation: true,
                fs_isolation: true,
                snapshot: false,
                resource_limits: true,
                streaming_io: false,
            },
        }
    }

    /// Override the declared capabilities (service-dependent).
    pub fn with_caps(mut self, caps: ProviderCaps) -> Self {
        self.caps = caps;
        self
    }

    fn check_status(status: u16, body: &str) -> Result<(), ProviderError> {
        if (200..300).contains(&status) {
            return Ok(());
        }
        Err(ProviderError::Remote { status, message: body.trim().to_string() })
    }
}

#[async_trait]
impl RuntimeProvider for RemoteSandbox {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::RemoteSandbox
    }

    fn capabilities(&self) -> ProviderCaps {
        self.caps
    }

    async fn spawn(&self, config: SpawnConfig) -> Result<SessionId, ProviderError> {
        let session_id = SessionId::new();
        let body = serde_json::json!({
            "id": session_id,
            "label": config.label,
            "image": config.image,
            "env": config.env,
            "limits": config.limits,
        })
        .to_string();

        let response = http::post(&self.addr, &self.auth_token, "/api/v1/sessions", &body).await?;
        Self::check_status(response.status, &response.body)?;

        debug!(session = %session_id, addr = %self.addr, "remote session created");
        Ok(session_id)
    }

    async fn execute(
        &self,
        session: &SessionId,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecOutcome, ProviderError> {
        let body = serde_json::json!({
            "command": command,
            "timeout_ms": options.timeout.as_millis() as u64,
            "stdin": options.stdin,
        })
        .to_string();
        let path = format!("/api/v1/sessions/{}/exec", session);

        let response = http::post(&self.addr, &self.auth_token, &path, &body).await?;
        Self::check_status(response.status, &response.body)?;

        let parsed: RemoteExecResponse = serde_json::from_str(&response.body)
            .map_err(|e| ProviderError::ExecFailed(format!("bad exec response: {}", e)))?;
        Ok(ExecOutcome {
            stdout: parsed.stdout,
            stderr: parsed.stderr,
            exit_code: parsed.exit_code,
            duration_ms: parsed.duration_ms,
            cost_units: parsed.cost_units,
        })
    }

    /// The service exposes no streaming endpoint; output is buffered and
    /// delivered as a single chunk followed by the exit event.
    async fn execute_stream(
        &self,
        session: &SessionId,
        command: &str,
    ) -> Result<ExecStream, ProviderError> {
        let outcome = self.execute(session, command, ExecOptions::default()).await?;
        let (tx, _cancel, stream) = exec_stream_channel();
        tokio::spawn(async move {
            if !outcome.stdout.is_empty() {
                let _ = tx.send(StreamEvent::Stdout(outcome.stdout.into_bytes())).await;
            }
            if !outcome.stderr.is_empty() {
                let _ = tx.send(StreamEvent::Stderr(outcome.stderr.into_bytes())).await;
            }
            let _ = tx.send(StreamEvent::Exited(outcome.exit_code)).await;
        });
        Ok(stream)
    }

    async fn health_check(&self, session: &SessionId) -> Result<HealthStatus, ProviderError> {
        let path = format!("/api/v1/sessions/{}/health", session);
        let response = http::get(&self.addr, &self.auth_token, &path).await?;
        Self::check_status(response.status, &response.body)?;

        let parsed: RemoteHealthResponse = serde_json::from_str(&response.body)
            .map_err(|e| ProviderError::ExecFailed(format!("bad health response: {}", e)))?;
        Ok(parsed.status)
    }

    async fn destroy(&self, session: &SessionId) -> Result<(), ProviderError> {
        let path = format!("/api/v1/sessions/{}", session);
        let response = http::delete(&self.addr, &self.auth_token, &path).await?;
        // Destroying an unknown session is not an error.
        if response.status == 404 {
            return Ok(());
        }
        Self::check_status(response.status, &response.body)
    }
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod tests;
