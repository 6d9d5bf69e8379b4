// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! fmd: the Foreman federation daemon.
//!
//! Accepts task submissions and worker registrations over a Unix socket,
//! routes tasks across the registered fleet, and keeps the audited state
//! durable across restarts.

mod bus;
mod lifecycle;
mod listener;

use lifecycle::{Config, LifecycleError};
use std::sync::Arc;
use tracing::{error, info};

fn init_tracing(config: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    let appender = tracing_appender::rolling::never(
        config.log_path.parent().unwrap_or(&config.state_dir),
        config
            .log_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "daemon.log".into()),
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
    guard
}

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fmd: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&config.state_dir) {
        eprintln!("fmd: cannot create state dir: {}", e);
        std::process::exit(1);
    }
    let _guard = init_tracing(&config);

    match run(config).await {
        Ok(()) => {}
        Err(LifecycleError::AlreadyRunning(path)) => {
            eprintln!("fmd: another daemon holds the lock at {}", path.display());
            std::process::exit(2);
        }
        Err(e) => {
            error!(error = %e, "daemon failed");
            eprintln!("fmd: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<(), LifecycleError> {
    let lifecycle::StartupResult { daemon, listener } = lifecycle::startup(config)?;
    let runtime = Arc::clone(&daemon.runtime);
    let bus = Arc::clone(&daemon.bus);
    let start_time = daemon.start_time;

    // READY handshake for supervisors and the CLI.
    println!("READY");
    info!("daemon ready");

    let accept_runtime = Arc::clone(&runtime);
    let accept = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(listener::handle_connection(
                        stream,
                        Arc::clone(&accept_runtime),
                        Arc::clone(&bus),
                        start_time,
                    ));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    loop {
        tokio::select! {
            result = runtime.run_once() => {
                if let Err(e) = result {
                    error!(error = %e, "engine loop error");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
        }
    }

    accept.abort();
    lifecycle::shutdown(&daemon).await;
    Ok(())
}
