// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::config::{BreakerConfig, EngineConfig};
use crate::health::FakeProber;
use fm_core::{
    BreakerKey, BreakerPhase, BudgetScope, ErrorKind, Event, EventSink, FakeClock, HealthStatus,
    InstanceConfig, InstanceId, ResourceCeilings, RetryPolicy, RuntimeKind, TaskSpec, TaskState,
    Telemetry,
};
use fm_providers::{FakeProvider, ProviderError, ProviderRegistry, RuntimeProvider};
use fm_storage::{AuditLog, MaterializedState};
use parking_lot::Mutex as PlMutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::tempdir;

struct RecordingSink(PlMutex<Vec<Event>>);

impl EventSink for RecordingSink {
    fn publish(&self, event: Event) {
        self.0.lock().push(event);
    }
}

struct Harness {
    runtime: Runtime<FakeClock>,
    clock: FakeClock,
    sink: Arc<RecordingSink>,
    remote: FakeProvider,
    micro: FakeProvider,
    host: FakeProvider,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_policy(Arc::new(fm_core::StaticPolicy::new()))
    }

    fn with_policy(policy: Arc<dyn fm_core::Policy>) -> Self {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new();
        let sink = Arc::new(RecordingSink(PlMutex::new(Vec::new())));

        let remote = FakeProvider::new(RuntimeKind::RemoteSandbox);
        let micro = FakeProvider::new(RuntimeKind::MicroVm);
        let host = FakeProvider::new(RuntimeKind::HostSandbox);
        let mut providers = ProviderRegistry::new();
        for provider in [remote.clone(), micro.clone(), host.clone()] {
            let key = provider.kind().key();
            providers.register(key, move || {
                Arc::new(provider.clone()) as Arc<dyn fm_providers::RuntimeProvider>
            });
        }

        let log = AuditLog::open(&dir.path().join("audit.log")).unwrap();
        let deps = RuntimeDeps {
            providers: Arc::new(providers),
            policy,
            prober: Arc::new(FakeProber::new()),
            sink: Arc::clone(&sink) as Arc<dyn EventSink>,
            log: Arc::new(PlMutex::new(log)),
            state: Arc::new(PlMutex::new(MaterializedState::new())),
            telemetry: Arc::new(Telemetry::new()),
            checkpoint_path: dir.path().join("checkpoint.zst"),
        };

        let config = EngineConfig {
            breaker: BreakerConfig { failure_threshold: 3, ..BreakerConfig::default() },
            ..EngineConfig::default()
        };
        let runtime = Runtime::new(deps, config, clock.clone());
        Harness { runtime, clock, sink, remote, micro, host, _dir: dir }
    }

    fn register_healthy(&self, id: &str, kinds: Vec<RuntimeKind>, caps: &[&str], max: u32) {
        let instance_id = InstanceId::from_string(id);
        self.runtime
            .register_instance(InstanceConfig {
                id: instance_id,
                endpoint: format!("10.0.0.1:{}", 7000),
                capabilities: caps.iter().map(|s| s.to_string()).collect(),
                ceilings: ResourceCeilings { max_sessions: max, ..ResourceCeilings::default() },
                region: String::new(),
                runtime_kinds: kinds,
            })
            .unwrap();
        self.runtime.auditor().with_state_mut(|state| {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.health.status = HealthStatus::Healthy;
            }
        });
    }

    fn spec() -> TaskSpec {
        TaskSpec::builder()
            .retry(RetryPolicy {
                max_attempts: 6,
                base_delay_ms: 0,
                max_delay_ms: 0,
                backoff: fm_core::Backoff::Fixed,
                jitter_pct: 0.0,
            })
            .build()
    }

    fn task_events(&self, id: &fm_core::TaskId) -> Vec<&'static str> {
        self.sink
            .0
            .lock()
            .iter()
            .filter(|e| e.task_id() == Some(*id))
            .map(|e| e.kind())
            .collect()
    }

    async fn settle(&self) {
        self.runtime.settle().await.unwrap();
    }
}

#[tokio::test]
async fn happy_path_single_attempt() {
    let h = Harness::new();
    h.register_healthy("ins-a", vec![RuntimeKind::MicroVm], &["code"], 4);

    let mut spec = Harness::spec();
    spec.required_capabilities = vec!["code".into()];
    let task_id = h.runtime.submit_task(spec).unwrap();
    h.settle().await;

    let task = h.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempts.len(), 1);
    assert_eq!(task.attempts[0].outcome, fm_core::AttemptOutcome::Ok);

    assert_eq!(
        h.task_events(&task_id),
        vec!["task:submitted", "task:admitted", "task:routed", "task:started", "task:completed"]
    );
    let snapshot = h.runtime.telemetry().snapshot();
    assert_eq!(snapshot.tasks_succeeded, 1);
    assert_eq!(snapshot.attempts, 1);
}

#[tokio::test]
async fn fallback_after_transient_remote_failures() {
    let h = Harness::new();
    h.register_healthy("ins-r", vec![RuntimeKind::RemoteSandbox], &[], 4);
    h.register_healthy("ins-m", vec![RuntimeKind::MicroVm], &[], 4);

    // Remote sandbox resets three times before the breaker opens.
    for _ in 0..3 {
        h.remote.push_spawn_error(ProviderError::Connection("connection reset".into()));
    }

    let task_id = h.runtime.submit_task(Harness::spec()).unwrap();
    h.settle().await;

    let task = h.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempts.len(), 4);
    for attempt in &task.attempts[..3] {
        assert_eq!(attempt.runtime_kind, RuntimeKind::RemoteSandbox);
        assert_eq!(attempt.error_kind, Some(ErrorKind::TransientRemote));
    }
    assert_eq!(task.attempts[3].runtime_kind, RuntimeKind::MicroVm);
    assert_eq!(task.attempts[3].outcome, fm_core::AttemptOutcome::Ok);

    // The per-instance breaker opened after three failures; later tasks
    // route around the remote sandbox.
    let key = BreakerKey::instance(RuntimeKind::RemoteSandbox, InstanceId::from_string("ins-r"));
    assert!(matches!(
        h.runtime.auditor().with_state(|state| state
            .breakers
            .get(&key.to_string())
            .map(|b| b.phase)),
        Some(BreakerPhase::Open)
    ));

    let second = h.runtime.submit_task(Harness::spec()).unwrap();
    h.settle().await;
    let second = h.runtime.get_task(&second).unwrap();
    assert_eq!(second.state, TaskState::Succeeded);
    assert_eq!(second.attempts.len(), 1);
    assert_eq!(second.attempts[0].runtime_kind, RuntimeKind::MicroVm);
}

#[tokio::test]
async fn policy_blocks_fallback_to_weaker_isolation() {
    let h = Harness::with_policy(Arc::new(fm_core::StaticPolicy::new().high_risk("tenant-a")));
    h.register_healthy("ins-r", vec![RuntimeKind::RemoteSandbox], &[], 4);
    h.register_healthy("ins-m", vec![RuntimeKind::MicroVm], &[], 4);
    h.register_healthy("ins-h", vec![RuntimeKind::HostSandbox], &[], 4);

    // Remote and microvm both fail transiently; host sandbox is available
    // but policy forbids the descent.
    for _ in 0..6 {
        h.remote.push_spawn_error(ProviderError::SpawnFailed("timeout".into()));
        h.micro.push_spawn_error(ProviderError::SpawnFailed("timeout".into()));
    }

    let task_id = h.runtime.submit_task(Harness::spec()).unwrap();
    h.settle().await;

    let task = h.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.failure.as_ref().unwrap().kind, ErrorKind::AllProvidersExhausted);
    assert!(h.task_events(&task_id).contains(&"task:fallback_blocked"));
    assert!(h.host.calls().is_empty());
}

#[tokio::test]
async fn backpressure_rejects_at_admission() {
    let h = Harness::new();
    for n in 0..10 {
        h.register_healthy(&format!("ins-{n}"), vec![RuntimeKind::MicroVm], &[], 25);
    }
    // Push every instance to 96% of its session ceiling.
    h.runtime.auditor().with_state_mut(|state| {
        for instance in state.instances.values_mut() {
            instance.load.active_sessions = 24;
        }
    });

    let failure = h.runtime.submit_task(Harness::spec()).unwrap_err();
    assert_eq!(failure.kind, ErrorKind::FederationCapacity);

    let rejected = h
        .runtime
        .telemetry()
        .rejected_count(&ErrorKind::FederationCapacity.to_string());
    assert_eq!(rejected, 1);

    // The task is terminal with no attempt recorded.
    let task = h
        .runtime
        .auditor()
        .with_state(|state| state.tasks.values().next().cloned())
        .unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.attempts.is_empty());
}

#[tokio::test]
async fn budget_rejection_at_ninety_five_percent() {
    let h = Harness::new();
    h.register_healthy("ins-a", vec![RuntimeKind::MicroVm], &[], 4);

    h.runtime.budgets().set_budget("tenant-a", BudgetScope::Daily, 1_000, &h.clock).unwrap();
    h.runtime.budgets().admit("tenant-a", 950, 0, false, &h.clock).unwrap();

    let mut spec = Harness::spec();
    spec.cost_estimate = 75;
    let failure = h.runtime.submit_task(spec).unwrap_err();
    assert_eq!(failure.kind, ErrorKind::BudgetExceeded);

    // The 90% alert fired when consumption hit 95%.
    let alerts: Vec<u8> = h
        .sink
        .0
        .lock()
        .iter()
        .filter_map(|e| match e {
            Event::BudgetAlert { threshold_pct, .. } => Some(*threshold_pct),
            _ => None,
        })
        .collect();
    assert!(alerts.contains(&90));
}

#[tokio::test]
async fn cancel_before_dispatch_and_idempotence() {
    let h = Harness::new();
    // No instances: the task parks in the cooldown/deferred path.

    let task_id = h.runtime.submit_task(Harness::spec()).unwrap();
    h.settle().await;
    assert_eq!(h.runtime.get_task(&task_id).unwrap().state, TaskState::Admitted);

    h.runtime.cancel_task(&task_id).unwrap();
    let task = h.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert!(task.attempts.is_empty());

    // Second cancel is a no-op on the terminal state.
    h.runtime.cancel_task(&task_id).unwrap();
    assert_eq!(h.runtime.get_task(&task_id).unwrap().state, TaskState::Cancelled);
}

#[tokio::test]
async fn deferred_task_dispatches_after_cooldown() {
    let h = Harness::new();
    let task_id = h.runtime.submit_task(Harness::spec()).unwrap();
    h.settle().await;
    assert_eq!(h.runtime.get_task(&task_id).unwrap().state, TaskState::Admitted);

    h.register_healthy("ins-a", vec![RuntimeKind::MicroVm], &[], 4);
    h.clock.advance(std::time::Duration::from_secs(6));
    h.settle().await;

    assert_eq!(h.runtime.get_task(&task_id).unwrap().state, TaskState::Succeeded);
}

#[tokio::test]
async fn past_deadline_is_invalid_input() {
    let h = Harness::new();
    h.clock.set_epoch_ms(10_000);

    let mut spec = Harness::spec();
    spec.deadline_ms = Some(5_000);
    let failure = h.runtime.submit_task(spec).unwrap_err();
    assert_eq!(failure.kind, ErrorKind::InvalidInput);
}

#[tokio::test]
async fn deadline_fires_while_waiting() {
    let h = Harness::new();
    h.clock.set_epoch_ms(10_000);

    let mut spec = Harness::spec();
    spec.deadline_ms = Some(12_000);
    let task_id = h.runtime.submit_task(spec).unwrap();
    h.settle().await;

    h.clock.advance(std::time::Duration::from_secs(3));
    h.settle().await;

    let task = h.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.failure.as_ref().unwrap().kind, ErrorKind::DeadlineExceeded);
}

#[tokio::test]
async fn quota_limits_active_tasks_per_tenant() {
    let h = Harness::new();
    h.register_healthy("ins-a", vec![RuntimeKind::MicroVm], &[], 8);
    h.runtime.budgets().set_budget("tenant-a", BudgetScope::Daily, 10_000, &h.clock).unwrap();
    h.runtime.budgets().set_quota(fm_core::Quota::new("tenant-a", 1, 8));

    // Park the first task by failing all its kinds slowly... simpler: no
    // second submit while the first is still active. Submit both quickly.
    h.remote.push_spawn_error(ProviderError::Connection("reset".into()));
    let first = h.runtime.submit_task(Harness::spec()).unwrap();
    let second = h.runtime.submit_task(Harness::spec());
    assert_eq!(second.unwrap_err().kind, ErrorKind::BudgetExceeded);

    h.settle().await;
    assert_eq!(h.runtime.get_task(&first).unwrap().state, TaskState::Succeeded);
}

#[tokio::test]
async fn register_heartbeat_deregister_flow() {
    let h = Harness::new();
    h.register_healthy("ins-a", vec![RuntimeKind::MicroVm], &[], 4);
    let id = InstanceId::from_string("ins-a");

    let load = fm_core::LoadSnapshot {
        cpu_util: 0.3,
        mem_util: 0.2,
        active_sessions: 1,
        queued_tasks: 0,
        last_updated_ms: 0,
    };
    h.runtime
        .heartbeat(&id, load, Some(BTreeSet::from(["code".to_string()])))
        .unwrap();
    assert_eq!(h.runtime.instances()[0].load.active_sessions, 1);

    h.runtime.deregister_instance(&id).unwrap();
    assert!(h.runtime.instances()[0].is_draining());

    // New tasks no longer route there; with no other instance they defer.
    let task_id = h.runtime.submit_task(Harness::spec()).unwrap();
    h.settle().await;
    assert_eq!(h.runtime.get_task(&task_id).unwrap().state, TaskState::Admitted);

    // Past the drain deadline the instance is removed entirely.
    h.clock.advance(h.runtime.config.drain.drain_deadline + std::time::Duration::from_secs(1));
    h.settle().await;
    assert!(h.runtime.instances().is_empty());
}

#[tokio::test]
async fn recovery_requeues_interrupted_work() {
    let h = Harness::new();
    h.register_healthy("ins-a", vec![RuntimeKind::MicroVm], &[], 4);

    // Simulate a task that died mid-run: place it directly in state.
    let task_id = {
        let mut task = fm_core::Task::new(
            fm_core::TaskId::new(),
            Harness::spec(),
            h.clock.epoch_ms(),
        );
        task.state = TaskState::Running;
        task.admitted_at_ms = Some(h.clock.epoch_ms());
        task.push_attempt(InstanceId::from_string("ins-a"), RuntimeKind::MicroVm, 0);
        let id = task.id;
        h.runtime.audit_task(&task, "absent", "running", None, vec![]).unwrap();
        id
    };

    h.runtime.recover().unwrap();
    h.settle().await;

    let task = h.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    // The interrupted attempt is recorded as a transient loss.
    assert_eq!(task.attempts[0].error_kind, Some(ErrorKind::TransientLocal));
    assert!(task.attempts.len() >= 2);
}
