// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! fm-providers: runtime execution backends behind one interface.
//!
//! A [`RuntimeProvider`] owns opaque session handles and exposes spawn /
//! execute / stream / health / destroy uniformly. Three backends ship
//! first-class:
//!
//! - [`HostSandbox`]: workspace-dir isolation on the local host
//! - [`MicroVmProvider`]: hardware-virtualized guests driven through a
//!   launcher binary
//! - [`RemoteSandbox`]: delegation to an external service over
//!   authenticated RPC
//!
//! New backends are added at build time by registering a factory under a
//! stable string key in [`ProviderRegistry`].

mod host;
pub(crate) mod http;
mod microvm;
mod registry;
mod remote;
mod stream;

pub use host::HostSandbox;
pub use microvm::MicroVmProvider;
pub use registry::ProviderRegistry;
pub use remote::RemoteSandbox;
pub use stream::{exec_stream_channel, ExecStream, StreamEvent};

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeCall, FakeProvider};

use async_trait::async_trait;
use fm_core::{ErrorKind, HealthStatus, ProviderCaps, RuntimeKind, SessionId, SnapshotId};
use std::time::Duration;
use thiserror::Error;

/// Errors from provider operations.
///
/// These never leave the engine as-is; [`ProviderError::error_kind`] maps
/// them into the boundary taxonomy first.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("execution timed out after {ms}ms")]
    ExecTimeout { ms: u64 },
    #[error("execution failed: {0}")]
    ExecFailed(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("remote error {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// Map into the boundary error taxonomy.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ProviderError::SpawnFailed(_)
            | ProviderError::SessionNotFound(_)
            | ProviderError::ExecTimeout { .. }
            | ProviderError::Io(_) => ErrorKind::TransientLocal,
            ProviderError::Connection(_) => ErrorKind::TransientRemote,
            ProviderError::Remote { status, .. } if *status >= 500 => ErrorKind::TransientRemote,
            ProviderError::Remote { .. }
            | ProviderError::ExecFailed(_)
            | ProviderError::Unsupported(_) => ErrorKind::PermanentProvider,
        }
    }
}

/// Resource limits requested for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    pub cpu_millis: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { cpu_millis: 1000, memory_mb: 1024, disk_mb: 4096 }
    }
}

/// Configuration for spawning a new session.
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    /// Human-readable label, used for workspace/guest naming (task id)
    pub label: String,
    /// Image reference, where the backend supports one
    pub image: Option<String>,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
}

/// Options for a single command execution.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub stdin: Option<String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(300), stdin: None }
    }
}

/// Result of a completed execution.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Backend-reported cost in cost units
    pub cost_units: u64,
}

/// Uniform surface over execution backends.
///
/// The session handle is an opaque identifier plus the provider kind; all
/// operations go through the provider, which owns the handle's resolution.
#[async_trait]
pub trait RuntimeProvider: Send + Sync + 'static {
    /// The runtime kind this provider implements.
    fn kind(&self) -> RuntimeKind;

    /// Feature flags advertised by this backend.
    fn capabilities(&self) -> ProviderCaps;

    /// Allocate a new session.
    async fn spawn(&self, config: SpawnConfig) -> Result<SessionId, ProviderError>;

    /// Run a command to completion inside the session.
    async fn execute(
        &self,
        session: &SessionId,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecOutcome, ProviderError>;

    /// Run a command, streaming output as it is produced.
    async fn execute_stream(
        &self,
        session: &SessionId,
        command: &str,
    ) -> Result<ExecStream, ProviderError>;

    /// Session-level liveness.
    async fn health_check(&self, session: &SessionId) -> Result<HealthStatus, ProviderError>;

    /// Capture a point-in-time snapshot of the session.
    async fn snapshot(&self, _session: &SessionId) -> Result<SnapshotId, ProviderError> {
        Err(ProviderError::Unsupported("snapshot"))
    }

    /// Materialize a new session from a snapshot.
    async fn restore(&self, _snapshot: &SnapshotId) -> Result<SessionId, ProviderError> {
        Err(ProviderError::Unsupported("restore"))
    }

    /// Tear the session down. Idempotent; destroying an unknown session is
    /// not an error.
    async fn destroy(&self, session: &SessionId) -> Result<(), ProviderError>;
}
