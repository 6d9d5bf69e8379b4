// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host sandbox: isolated filesystem workspace on the local host.
//!
//! No kernel boundary, no enforceable resource limits, no network
//! isolation. Cheapest backend; routed to only when tenant policy
//! explicitly permits it.

use crate::stream::{exec_stream_channel, ExecStream, StreamEvent};
use crate::{ExecOptions, ExecOutcome, ProviderError, RuntimeProvider, SpawnConfig};
use async_trait::async_trait;
use fm_core::{HealthStatus, ProviderCaps, RuntimeKind, SessionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Cost units per second of wall-clock execution.
const COST_PER_SECOND: u64 = 1;

struct HostSession {
    workdir: PathBuf,
    env: Vec<(String, String)>,
}

/// Workspace-directory sandbox on the local host.
pub struct HostSandbox {
    base_dir: PathBuf,
    sessions: Arc<Mutex<HashMap<SessionId, HostSession>>>,
}

impl HostSandbox {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir, sessions: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn session_env(&self, session: &SessionId) -> Result<(PathBuf, Vec<(String, String)>), ProviderError> {
        let sessions = self.sessions.lock();
        let entry = sessions
            .get(session)
            .ok_or_else(|| ProviderError::SessionNotFound(session.to_string()))?;
        Ok((entry.workdir.clone(), entry.env.clone()))
    }

    fn shell_command(workdir: &Path, env: &[(String, String)], command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(workdir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RuntimeProvider for HostSandbox {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::HostSandbox
    }

    fn capabilities(&self) -> ProviderCaps {
        ProviderCaps {
            network_isolation: false,
            fs_isolation: true,
            snapshot: false,
            resource_limits: false,
            streaming_io: true,
        }
    }

    async fn spawn(&self, config: SpawnConfig) -> Result<SessionId, ProviderError> {
        let session_id = SessionId::new();
        let workdir = self.base_dir.join(format!("{}-{}", config.label, session_id.short(8)));
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| ProviderError::SpawnFailed(format!("workspace create: {}", e)))?;

        debug!(session = %session_id, workdir = %workdir.display(), "host session spawned");
        self.sessions
            .lock()
            .insert(session_id, HostSession { workdir, env: config.env });
        Ok(session_id)
    }

    async fn execute(
        &self,
        session: &SessionId,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecOutcome, ProviderError> {
        let (workdir, env) = self.session_env(session)?;
        let started = std::time::Instant::now();

        let mut cmd = Self::shell_command(&workdir, &env, command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
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
            cost_units: cost_for(duration_ms),
        })
    }

    async fn execute_stream(
        &self,
        session: &SessionId,
        command: &str,
    ) -> Result<ExecStream, ProviderError> {
        let (workdir, env) = self.session_env(session)?;

        let mut cmd = Self::shell_command(&workdir, &env, command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

        let (tx, cancel, stream) = exec_stream_channel();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        tokio::spawn(async move {
            let mut out_buf = [0u8; 4096];
            let mut err_buf = [0u8; 4096];
            let mut out_done = stdout.is_none();
            let mut err_done = stderr.is_none();

            loop {
                if out_done && err_done {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        let _ = tx.send(StreamEvent::Exited(-1)).await;
                        return;
                    }
                    read = read_some(&mut stdout, &mut out_buf), if !out_done => {
                        match read {
                            Some(bytes) => {
                                if tx.send(StreamEvent::Stdout(bytes)).await.is_err() {
                                    let _ = child.kill().await;
                                    return;
                                }
                            }
                            None => out_done = true,
                        }
                    }
                    read = read_some(&mut stderr, &mut err_buf), if !err_done => {
                        match read {
                            Some(bytes) => {
                                if tx.send(StreamEvent::Stderr(bytes)).await.is_err() {
                                    let _ = child.kill().await;
                                    return;
                                }
                            }
                            None => err_done = true,
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
        let (workdir, _) = self.session_env(session)?;
        Ok(if workdir.is_dir() { HealthStatus::Healthy } else { HealthStatus::Unhealthy })
    }

    async fn destroy(&self, session: &SessionId) -> Result<(), ProviderError> {
        let removed = self.sessions.lock().remove(session);
        if let Some(entry) = removed {
            if let Err(e) = tokio::fs::remove_dir_all(&entry.workdir).await {
                warn!(session = %session, error = %e, "workspace cleanup failed");
            }
        }
        Ok(())
    }
}

fn cost_for(duration_ms: u64) -> u64 {
    (duration_ms * COST_PER_SECOND).div_ceil(1000).max(1)
}

/// Read a chunk from an optional stream; `None` signals EOF or absence.
async fn read_some<R>(reader: &mut Option<R>, buf: &mut [u8]) -> Option<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let r = reader.as_mut()?;
    match r.read(buf).await {
        Ok(0) | Err(_) => None,
        Ok(n) => Some(buf[..n].to_vec()),
    }
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;
