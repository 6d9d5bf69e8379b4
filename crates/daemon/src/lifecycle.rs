// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle management: startup, recovery, shutdown.

use crate::bus::SubscriberBus;
use fm_core::{EventSink, StaticPolicy, SystemClock, Telemetry};
use fm_engine::{EngineConfig, EngineError, HttpProber, Runtime, RuntimeDeps};
use fm_providers::{HostSandbox, MicroVmProvider, ProviderRegistry, RemoteSandbox, RuntimeProvider};
use fm_storage::{AuditError, AuditLog, Checkpoint, MaterializedState};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UnixListener;
use tracing::{info, warn};

/// Daemon runtime with concrete clock.
pub type DaemonRuntime = Runtime<SystemClock>;

/// How long the daemon keeps dispatching after a shutdown signal.
const ADMISSION_DRAIN_WINDOW: Duration = Duration::from_secs(2);

/// How long running tasks get to finish before forced cancellation.
const RUNNING_DRAIN_WINDOW: Duration = Duration::from_secs(30);

/// Errors during daemon startup/shutdown.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("another daemon holds the lock at {0}")]
    AlreadyRunning(PathBuf),
    #[error("storage error: {0}")]
    Storage(#[from] AuditError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("no home directory available")]
    NoStateDir,
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root state directory (e.g. ~/.local/state/foreman)
    pub state_dir: PathBuf,
    /// Path to Unix socket
    pub socket_path: PathBuf,
    /// Path to lock/PID file
    pub lock_path: PathBuf,
    /// Path to daemon log file
    pub log_path: PathBuf,
    /// Path to the audit log
    pub audit_path: PathBuf,
    /// Path to the checkpoint file
    pub checkpoint_path: PathBuf,
    /// Base directory for host-sandbox workspaces
    pub workspaces_path: PathBuf,
}

impl Config {
    /// Load configuration for the user-level daemon.
    ///
    /// Uses fixed paths under `$XDG_STATE_HOME/foreman` (falling back to
    /// `~/.local/state/foreman`). One daemon serves the whole machine.
    pub fn load() -> Result<Self, LifecycleError> {
        let state_dir = state_dir()?;
        Ok(Self {
            socket_path: state_dir.join("daemon.sock"),
            lock_path: state_dir.join("daemon.pid"),
            log_path: state_dir.join("daemon.log"),
            audit_path: state_dir.join("audit").join("entries.log"),
            checkpoint_path: state_dir.join("checkpoint.zst"),
            workspaces_path: state_dir.join("workspaces"),
            state_dir,
        })
    }
}

fn state_dir() -> Result<PathBuf, LifecycleError> {
    if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir).join("foreman"));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join("foreman"))
        .ok_or(LifecycleError::NoStateDir)
}

/// Daemon state during operation.
pub struct DaemonState {
    pub config: Config,
    // NOTE(lifetime): Held to maintain exclusive file lock; released on drop
    #[allow(dead_code)]
    lock_file: File,
    pub runtime: Arc<DaemonRuntime>,
    pub bus: Arc<SubscriberBus>,
    pub start_time: Instant,
}

/// Result of daemon startup: the state plus the socket listener to serve.
pub struct StartupResult {
    pub daemon: DaemonState,
    pub listener: UnixListener,
}

/// Bring the daemon up: lock, recover state, build the runtime, bind the
/// socket.
pub fn startup(config: Config) -> Result<StartupResult, LifecycleError> {
    std::fs::create_dir_all(&config.state_dir)?;
    std::fs::create_dir_all(&config.workspaces_path)?;

    // Exclusive daemon lock; a second daemon exits early.
    let mut lock_file = File::create(&config.lock_path)?;
    if lock_file.try_lock_exclusive().is_err() {
        return Err(LifecycleError::AlreadyRunning(config.lock_path.clone()));
    }
    let _ = writeln!(lock_file, "{}", std::process::id());

    // Checkpoint + replay recovery.
    let mut log = AuditLog::open(&config.audit_path)?;
    let mut state = match Checkpoint::load(&config.checkpoint_path)? {
        Some(checkpoint) => {
            info!(applied_seq = checkpoint.applied_seq(), "checkpoint loaded");
            checkpoint.state
        }
        None => MaterializedState::new(),
    };
    let tail = log.entries_after(state.applied_seq)?;
    if !tail.is_empty() {
        info!(entries = tail.len(), "replaying audit tail");
        state.replay(tail.iter());
    }

    let telemetry = Arc::new(Telemetry::new());
    let bus = Arc::new(SubscriberBus::new(Arc::clone(&telemetry)));

    let deps = RuntimeDeps {
        providers: Arc::new(builtin_providers(&config)),
        policy: Arc::new(StaticPolicy::new()),
        prober: Arc::new(HttpProber),
        sink: Arc::clone(&bus) as Arc<dyn EventSink>,
        log: Arc::new(Mutex::new(log)),
        state: Arc::new(Mutex::new(state)),
        telemetry,
        checkpoint_path: config.checkpoint_path.clone(),
    };
    let runtime = Arc::new(Runtime::new(deps, EngineConfig::default(), SystemClock));
    runtime.recover()?;

    // Bind the socket, clearing any stale file from a dead daemon.
    let _ = std::fs::remove_file(&config.socket_path);
    let listener = UnixListener::bind(&config.socket_path)?;
    info!(socket = %config.socket_path.display(), "daemon listening");

    Ok(StartupResult {
        daemon: DaemonState {
            config,
            lock_file,
            runtime,
            bus,
            start_time: Instant::now(),
        },
        listener,
    })
}

/// The closed set of built-in provider factories.
///
/// The microvm launcher binary and the remote sandbox endpoint come from
/// the environment; the remote factory is registered only when an endpoint
/// is configured.
fn builtin_providers(config: &Config) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    let workspaces = config.workspaces_path.clone();
    registry.register("host-sandbox", move || {
        Arc::new(HostSandbox::new(workspaces.clone())) as Arc<dyn RuntimeProvider>
    });

    let launcher = std::env::var("FM_VMCTL").unwrap_or_else(|_| "fm-vmctl".into());
    registry.register("microvm", move || {
        Arc::new(MicroVmProvider::new(PathBuf::from(launcher.clone())))
            as Arc<dyn RuntimeProvider>
    });

    if let Ok(addr) = std::env::var("FM_REMOTE_ADDR") {
        let token = std::env::var("FM_REMOTE_TOKEN").unwrap_or_default();
        registry.register("remote-sandbox", move || {
            Arc::new(RemoteSandbox::new(addr.clone(), token.clone())) as Arc<dyn RuntimeProvider>
        });
    }

    registry
}

/// Graceful shutdown: stop admission, drain, cancel stragglers, flush.
pub async fn shutdown(daemon: &DaemonState) {
    info!("shutdown requested");
    daemon.runtime.begin_shutdown();

    // Keep dispatching briefly so near-finished work completes.
    let drain_until = Instant::now() + ADMISSION_DRAIN_WINDOW;
    while Instant::now() < drain_until {
        let _ = daemon.runtime.run_pending().await;
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    match daemon.runtime.cancel_queued_tasks() {
        Ok(cancelled) if cancelled > 0 => info!(cancelled, "queued tasks cancelled"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "queued-task cancellation failed"),
    }

    // Allow running tasks their window.
    let running_until = Instant::now() + RUNNING_DRAIN_WINDOW;
    while Instant::now() < running_until && !daemon.runtime.active_tasks().is_empty() {
        let _ = daemon.runtime.run_pending().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Whatever is left gets a cooperative cancel plus grace.
    if !daemon.runtime.active_tasks().is_empty() {
        warn!(
            remaining = daemon.runtime.active_tasks().len(),
            "running drain window expired, cancelling sessions"
        );
        daemon.runtime.cancel_running_tasks();
        let grace_until = Instant::now() + Duration::from_secs(10);
        while Instant::now() < grace_until && !daemon.runtime.active_tasks().is_empty() {
            let _ = daemon.runtime.run_pending().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    if let Err(e) = daemon.runtime.flush() {
        warn!(error = %e, "final audit flush failed");
    }
    let _ = std::fs::remove_file(&daemon.config.socket_path);
    let _ = std::fs::remove_file(&daemon.config.lock_path);
    info!("shutdown complete");
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
