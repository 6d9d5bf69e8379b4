// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::config::HealthConfig;
use crate::registry::InstanceRegistry;
use fm_core::{FakeClock, InstanceConfig, NullSink, ResourceCeilings, RuntimeKind};
use fm_storage::{AuditLog, MaterializedState};
use std::time::Duration;
use tempfile::tempdir;

struct Fixture {
    monitor: HealthMonitor,
    registry: InstanceRegistry,
    prober: Arc<FakeProber>,
    clock: FakeClock,
    id: InstanceId,
    _dir: tempfile::TempDir,
}

fn fixture(config: HealthConfig) -> Fixture {
    let dir = tempdir().unwrap();
    let log = AuditLog::open(&dir.path().join("audit.log")).unwrap();
    let auditor = Auditor::new(
        Arc::new(Mutex::new(log)),
        Arc::new(Mutex::new(MaterializedState::new())),
        Arc::new(NullSink),
    );
    let clock = FakeClock::new();
    let registry = InstanceRegistry::new(auditor.clone());
    let id = InstanceId::from_string("ins-h1");
    registry
        .register(
            InstanceConfig {
                id,
                endpoint: "10.0.0.1:7070".into(),
                capabilities: Default::default(),
                ceilings: ResourceCeilings::default(),
                region: String::new(),
                runtime_kinds: vec![RuntimeKind::MicroVm],
            },
            &clock,
        )
        .unwrap();

    let prober = Arc::new(FakeProber::new());
    let monitor = HealthMonitor::new(config, auditor, Arc::clone(&prober) as Arc<dyn Prober>);
    Fixture { monitor, registry, prober, clock, id, _dir: dir }
}

fn config() -> HealthConfig {
    HealthConfig {
        probe_interval: Duration::from_secs(15),
        degraded_latency: Duration::from_millis(500),
        degraded_util: 0.85,
        unhealthy_consecutive_failures: 3,
        healthy_consecutive_successes: 2,
        remove_after: Duration::from_secs(300),
        probe_pool_max: 32,
    }
}

fn ok_report(latency_ms: u64) -> Result<ProbeReport, String> {
    Ok(ProbeReport { latency_ms, load: None })
}

#[tokio::test]
async fn unknown_becomes_healthy_after_consecutive_successes() {
    let f = fixture(config());
    assert_eq!(f.registry.get(&f.id).unwrap().health.status, HealthStatus::Unknown);

    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    assert_eq!(f.registry.get(&f.id).unwrap().health.status, HealthStatus::Unknown);

    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    assert_eq!(f.registry.get(&f.id).unwrap().health.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn slow_probe_degrades_a_healthy_instance() {
    let f = fixture(config());
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();

    f.prober.push(f.id, ok_report(2_000));
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    assert_eq!(f.registry.get(&f.id).unwrap().health.status, HealthStatus::Degraded);

    // Recovery after enough clean probes.
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    assert_eq!(f.registry.get(&f.id).unwrap().health.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn high_utilization_degrades() {
    let f = fixture(config());
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();

    f.prober.push(
        f.id,
        Ok(ProbeReport {
            latency_ms: 5,
            load: Some(fm_core::LoadSnapshot {
                cpu_util: 0.95,
                mem_util: 0.2,
                active_sessions: 3,
                queued_tasks: 0,
                last_updated_ms: 0,
            }),
        }),
    );
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();

    let instance = f.registry.get(&f.id).unwrap();
    assert_eq!(instance.health.status, HealthStatus::Degraded);
    // The capacity report was applied.
    assert_eq!(instance.load.active_sessions, 3);
}

#[tokio::test]
async fn consecutive_failures_reach_unhealthy_then_removal() {
    let f = fixture(config());
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();

    f.prober.push_n(f.id, Err("connection refused".into()), 5);

    // First failure: degraded. Third: unhealthy.
    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    assert_eq!(f.registry.get(&f.id).unwrap().health.status, HealthStatus::Degraded);

    f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    let removals = f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    assert!(removals.is_empty());
    let instance = f.registry.get(&f.id).unwrap();
    assert_eq!(instance.health.status, HealthStatus::Unhealthy);
    assert!(instance.health.last_error.is_some());

    // Past the removal window, the cycle reports the instance for removal.
    f.clock.advance(Duration::from_secs(301));
    let removals = f.monitor.run_cycle(&f.registry, &f.clock).await.unwrap();
    assert_eq!(removals, vec![f.id]);
}
