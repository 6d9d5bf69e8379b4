// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test federation: scripted providers, fake clock, recording sink.

use fm_core::{
    Backoff, Event, EventSink, FakeClock, HealthStatus, InstanceConfig, InstanceId, Policy,
    ResourceCeilings, RetryPolicy, RuntimeKind, StaticPolicy, TaskId, TaskSpec, Telemetry,
};
use fm_engine::{BreakerConfig, EngineConfig, FakeProber, Runtime, RuntimeDeps};
use fm_providers::{FakeProvider, ProviderRegistry, RuntimeProvider};
use fm_storage::{AuditLog, MaterializedState};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct RecordingSink(pub Mutex<Vec<Event>>);

impl EventSink for RecordingSink {
    fn publish(&self, event: Event) {
        self.0.lock().push(event);
    }
}

pub struct Federation {
    pub runtime: Runtime<FakeClock>,
    pub clock: FakeClock,
    pub sink: Arc<RecordingSink>,
    pub remote: FakeProvider,
    pub micro: FakeProvider,
    pub host: FakeProvider,
    pub _dir: tempfile::TempDir,
}

impl Federation {
    pub fn new() -> Self {
        Self::with_policy(Arc::new(StaticPolicy::new()))
    }

    pub fn with_policy(policy: Arc<dyn Policy>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = FakeClock::new();
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));

        let remote = FakeProvider::new(RuntimeKind::RemoteSandbox);
        let micro = FakeProvider::new(RuntimeKind::MicroVm);
        let host = FakeProvider::new(RuntimeKind::HostSandbox);
        let mut providers = ProviderRegistry::new();
        for provider in [remote.clone(), micro.clone(), host.clone()] {
            let key = provider.kind().key();
            providers
                .register(key, move || Arc::new(provider.clone()) as Arc<dyn RuntimeProvider>);
        }

        let log = AuditLog::open(&dir.path().join("audit.log")).unwrap();
        let deps = RuntimeDeps {
            providers: Arc::new(providers),
            policy,
            prober: Arc::new(FakeProber::new()),
            sink: Arc::clone(&sink) as Arc<dyn EventSink>,
            log: Arc::new(Mutex::new(log)),
            state: Arc::new(Mutex::new(MaterializedState::new())),
            telemetry: Arc::new(Telemetry::new()),
            checkpoint_path: dir.path().join("checkpoint.zst"),
        };
        let config = EngineConfig {
            breaker: BreakerConfig { failure_threshold: 3, ..BreakerConfig::default() },
            ..EngineConfig::default()
        };
        let runtime = Runtime::new(deps, config, clock.clone());
        Federation { runtime, clock, sink, remote, micro, host, _dir: dir }
    }

    /// Register an instance and mark it healthy immediately.
    pub fn add_instance(&self, id: &str, kinds: Vec<RuntimeKind>, caps: &[&str], max: u32) {
        self.runtime
            .register_instance(InstanceConfig {
                id: InstanceId::from_string(id),
                endpoint: "10.0.0.1:7070".into(),
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

    /// Task spec with instant retries so tests never sleep.
    pub fn spec() -> TaskSpec {
        TaskSpec::builder()
            .retry(RetryPolicy {
                max_attempts: 6,
                base_delay_ms: 0,
                max_delay_ms: 0,
                backoff: Backoff::Fixed,
                jitter_pct: 0.0,
            })
            .build()
    }

    /// Event type tags observed for one task, in publication order.
    pub fn task_events(&self, id: &TaskId) -> Vec<&'static str> {
        self.sink
            .0
            .lock()
            .iter()
            .filter(|e| e.task_id() == Some(*id))
            .map(|e| e.kind())
            .collect()
    }

    pub async fn settle(&self) {
        self.runtime.settle().await.unwrap();
    }
}
