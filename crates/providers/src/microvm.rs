// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! MicroVM backend: hardware-virtualized guests driven through a launcher
//! binary (`fm-vmctl` by default).
//!
//! The launcher owns the VMM details; this provider shells out with
//! space-separated subcommands: `create`, `exec`, `status`, `snapshot`,
//! `restore`, `destroy`. CPU/memory/disk ceilings are enforced by the
//! guest, read-only root where the image supports it.

use crate::stream::{exec_stream_channel, ExecStream, StreamEvent};
use crate::{ExecOptions, ExecOutcome, ProviderError, RuntimeProvider, SpawnConfig};
use async_trait::async_trait;
use fm_core::{HealthStatus, ProviderCaps, RuntimeKind, SessionId, SnapshotId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Cost units per second of guest wall-clock.
const COST_PER_SECOND: u64 = 5;

/// Grace period for launcher control commands (not guest execution).
const CONTROL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// MicroVM sessions driven through a launcher binary.
pub struct MicroVmProvider {
    launcher: PathBuf,
    sessions: Arc<Mutex<HashSet<SessionId>>>,
}

impl MicroVmProvider {
    pub fn new(launcher: PathBuf) -> Self {
        Self { launcher, sessions: Arc::new(Mutex::new(HashSet::new())) }
    }

    fn require_session(&self, session: &SessionId) -> Result<(), ProviderError> {
        if self.sessions.lock().contains(session) {
            Ok(())
        } else {
            Err(ProviderError::SessionNotFound(session.to_string()))
        }
    }

    /// Run a launcher control command to completion with a bounded wait.
    async fn control(&self, args: &[&str]) -> Result<std::process::Output, ProviderError> {
        let child = Command::new(&self.launcher)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::SpawnFailed(format!("launcher: {}", e)))?;

        match tokio::time::timeout(CONTROL_TIMEOUT, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ProviderError::ExecFailed(e.to_string())),
            Err(_) => Err(ProviderError::ExecTimeout { ms: CONTROL_TIMEOUT.as_millis() as u64 }),
        }
    }

    fn check_control(output: &std::process::Output, context: &str) -> Result<(), ProviderError> {
        if output.status.success() {
            return Ok(());
        }
        Err(ProviderError::SpawnFailed(format!(
            "{}: {}",
            context,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[async_trait]
impl RuntimeProvider for MicroVmProvider {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::MicroVm
    }

    fn capabilities(&self) -> ProviderCaps {
        ProviderCaps {
            network_isolation: true,
            fs_isolation: true,
            snapshot: true,
            resource_limits: true,
            streaming_io: true,
        }
    }

    async fn spawn(&self, config: SpawnConfig) -> Result<SessionId, ProviderError> {
        let session_id = SessionId::new();
        let cpu = config.limits.cpu_millis.to_string();
        let memory = config.limits.memory_mb.to_string();
        let disk = config.limits.disk_mb.to_string();

        let mut args = vec![
            "create",
            "--name",
            session_id.as_str(),
            "--cpu-millis",
            &cpu,
            "--memory-mb",
            &memory,
            "--disk-mb",
            &disk,
        ];
        if let Some(image) = &config.image {
            args.push("--image");
            args.push(image);
        }
        let env_flags: Vec<String> =
            config.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        for flag in &env_flags {
            args.push("--env");
            args.push(flag);
        }

        let output = self.control(&args).await?;
        Self::check_control(&output, "create")?;

        debug!(session = %session_id, "microvm guest created");
        self.sessions.lock().insert(session_id);
        Ok(session_id)
    }

    async fn execute(
        &self,
        session: &SessionId,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecOutcome, ProviderError> {
        self.require_session(session)?;
        let started = std::time::Instant::now();

        let mut cmd = Command::new(&self.launcher);
        cmd.args(["exec", session.as_str(), "--", "sh", "-c", command])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.stdin(if options.stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd.spawn().map_err(|e| ProviderError::ExecFailed(e.to_string()))?;
        if let Some(input) = &options.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|e| ProviderError::ExecFailed(format!("stdin: {}", e)))?;
            }
        }

        let output = match tokio::time::timeout(options.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ProviderError::ExecFailed(e.to_string()))?,
            Err(_) => {
                return Err(ProviderError::ExecTimeout { ms: options.timeout.as_millis() as u64 })
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        Ok(ExecOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms,
            cost_units: (duration_ms * COST_PER_SECOND).div_ceil(1000).max(1),
        })
    }

    async fn execute_stream(
        &self,
        session: &SessionId,
        command: &str,
    ) -> Result<ExecStream, ProviderError> {
        self.require_session(session)?;

        let mut child = Command::new(&self.launcher)
            .args(["exec", session.as_str(), "--", "sh", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

        let (tx, cancel, stream) = exec_stream_channel();
        let mut stdout = child.stdout.take();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        let _ = tx.send(StreamEvent::Exited(-1)).await;
                        return;
                    }
                    read = async {
                        match stdout.as_mut() {
                            Some(r) => match r.read(&mut buf).await {
                                Ok(0) | Err(_) => None,
                                Ok(n) => Some(buf[..n].to_vec()),
                            },
                            None => None,
                        }
                    } => {
                        match read {
                            Some(bytes) => {
                                if tx.send(StreamEvent::Stdout(bytes)).await.is_err() {
                                    let _ = child.kill().await;
                                    return;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }

            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = tx.send(StreamEvent::Exited(code)).await;
        });

        Ok(stream)
    }

    async fn health_check(&self, session: &SessionId) -> Result<HealthStatus, ProviderError> {
        self.require_session(session)?;
        let output = self.control(&["status", session.as_str()]).await?;
        Ok(if output.status.success() { HealthStatus::Healthy } else { HealthStatus::Unhealthy })
    }

    async fn snapshot(&self, session: &SessionId) -> Result<SnapshotId, ProviderError> {
        self.require_session(session)?;
        let snapshot_id = SnapshotId::new();
        let output =
            self.control(&["snapshot", session.as_str(), "--tag", snapshot_id.as_str()]).await?;
        Self::check_control(&output, "snapshot")?;
        Ok(snapshot_id)
    }

    async fn restore(&self, snapshot: &SnapshotId) -> Result<SessionId, ProviderError> {
        let session_id = SessionId::new();
        let output = self
            .control(&["restore", "--tag", snapshot.as_str(), "--name", session_id.as_str()])
            .await?;
        Self::check_control(&output, "restore")?;
        self.sessions.lock().insert(session_id);
        Ok(session_id)
    }

    async fn destroy(&self, session: &SessionId) -> Result<(), ProviderError> {
        if self.sessions.lock().remove(session) {
            if let Err(e) = self.control(&["destroy", session.as_str()]).await {
                warn!(session = %session, error = %e, "guest teardown failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "microvm_tests.rs"]
mod tests;
