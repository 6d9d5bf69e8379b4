// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::audit::Auditor;
use crate::config::BreakerConfig;
use fm_core::{
    FakeClock, HealthState, Instance, NullSink, ResourceCeilings, Task, TaskId, TaskSpec,
};
use fm_storage::{AuditLog, MaterializedState};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;

fn breakers(dir: &tempfile::TempDir) -> BreakerBoard {
    let log = AuditLog::open(&dir.path().join("audit.log")).unwrap();
    let auditor = Auditor::new(
        Arc::new(Mutex::new(log)),
        Arc::new(Mutex::new(MaterializedState::new())),
        Arc::new(NullSink),
    );
    BreakerBoard::new(BreakerConfig::default(), auditor)
}

fn healthy(id: &str, active: u32, max: u32) -> Instance {
    let mut instance = Instance::builder()
        .id(id)
        .ceilings(ResourceCeilings { max_sessions: max, ..ResourceCeilings::default() })
        .runtime_kinds(vec![RuntimeKind::MicroVm])
        .build();
    instance.load.active_sessions = active;
    instance
}

fn task() -> Task {
    Task::new(TaskId::from_string("tsk-r"), TaskSpec::builder().build(), 0)
}

#[test]
fn backpressure_rejects_at_threshold() {
    let router = Router::new(RouterConfig::default());

    // 10 instances at 96% utilization.
    let instances: Vec<Instance> =
        (0..10).map(|n| healthy(&format!("ins-{n}"), 24, 25)).collect();
    assert!((Router::global_utilization(&instances) - 0.96).abs() < 1e-9);
    assert_eq!(router.check_backpressure(&instances), Err(RouteError::FederationCapacity));

    // Just below the threshold admission passes.
    let instances: Vec<Instance> =
        (0..10).map(|n| healthy(&format!("ins-{n}"), 23, 25)).collect();
    assert!(router.check_backpressure(&instances).is_ok());
}

#[test]
fn full_instances_are_excluded_and_boundary_is_exclusive() {
    let dir = tempdir().unwrap();
    let clock = FakeClock::new();
    let router = Router::new(RouterConfig::default());
    let board = breakers(&dir);

    let full = healthy("ins-a", 4, 4);
    let nearly = healthy("ins-b", 3, 4);
    let decision = router
        .select(&task(), RuntimeKind::MicroVm, &[full, nearly], &board, None, &[], None, &clock)
        .unwrap();
    assert_eq!(decision.instance_id, InstanceId::from_string("ins-b"));
}

#[test]
fn unhealthy_never_selected_degraded_only_as_last_resort() {
    let dir = tempdir().unwrap();
    let clock = FakeClock::new();
    let router = Router::new(RouterConfig::default());
    let board = breakers(&dir);

    let mut unhealthy = healthy("ins-a", 0, 4);
    unhealthy.health =
        HealthState { status: HealthStatus::Unhealthy, last_probe_ms: 1, last_error: None };
    let mut degraded = healthy("ins-b", 0, 4);
    degraded.health =
        HealthState { status: HealthStatus::Degraded, last_probe_ms: 1, last_error: None };
    let fine = healthy("ins-c", 0, 4);

    // Healthy wins over degraded.
    let decision = router
        .select(
            &task(),
            RuntimeKind::MicroVm,
            &[unhealthy.clone(), degraded.clone(), fine],
            &board,
            None,
            &[],
            None,
            &clock,
        )
        .unwrap();
    assert_eq!(decision.instance_id, InstanceId::from_string("ins-c"));

    // Without a healthy candidate the degraded one is used.
    let decision = router
        .select(
            &task(),
            RuntimeKind::MicroVm,
            &[unhealthy.clone(), degraded],
            &board,
            None,
            &[],
            None,
            &clock,
        )
        .unwrap();
    assert_eq!(decision.instance_id, InstanceId::from_string("ins-b"));

    // Unhealthy alone means no candidate.
    let result = router.select(
        &task(),
        RuntimeKind::MicroVm,
        &[unhealthy],
        &board,
        None,
        &[],
        None,
        &clock,
    );
    assert_eq!(result.unwrap_err(), RouteError::NoEligibleInstance);
}

#[test]
fn required_capabilities_filter() {
    let dir = tempdir().unwrap();
    let clock = FakeClock::new();
    let router = Router::new(RouterConfig::default());
    let board = breakers(&dir);

    let mut with_gpu = healthy("ins-a", 0, 4);
    with_gpu.capabilities = ["code".to_string(), "gpu".to_string()].into();
    let mut without = healthy("ins-b", 0, 4);
    without.capabilities = ["code".to_string()].into();

    let mut task = task();
    task.spec.required_capabilities = vec!["gpu".into()];

    let decision = router
        .select(&task, RuntimeKind::MicroVm, &[with_gpu, without], &board, None, &[], None, &clock)
        .unwrap();
    assert_eq!(decision.instance_id, InstanceId::from_string("ins-a"));
}

#[test]
fn region_preference_binds_only_when_satisfiable() {
    let dir = tempdir().unwrap();
    let clock = FakeClock::new();
    let router = Router::new(RouterConfig::default());
    let board = breakers(&dir);

    let mut east = healthy("ins-a", 2, 4);
    east.region = "us-east".into();
    let mut west = healthy("ins-b", 0, 4);
    west.region = "us-west".into();

    let mut task = task();
    task.spec.preferred_region = Some("us-east".into());

    // Region match beats the lower-utilization instance elsewhere.
    let decision = router
        .select(
            &task,
            RuntimeKind::MicroVm,
            &[east, west.clone()],
            &board,
            None,
            &[],
            None,
            &clock,
        )
        .unwrap();
    assert_eq!(decision.instance_id, InstanceId::from_string("ins-a"));

    // With nobody in the region, the preference is ignored.
    let decision = router
        .select(&task, RuntimeKind::MicroVm, &[west], &board, None, &[], None, &clock)
        .unwrap();
    assert_eq!(decision.instance_id, InstanceId::from_string("ins-b"));
}

#[test]
fn affinity_wins_when_still_eligible() {
    let dir = tempdir().unwrap();
    let clock = FakeClock::new();
    let router = Router::new(RouterConfig::default());
    let board = breakers(&dir);

    let busy = healthy("ins-a", 3, 4);
    let idle = healthy("ins-b", 0, 4);

    let decision = router
        .select(
            &task(),
            RuntimeKind::MicroVm,
            &[busy, idle],
            &board,
            Some(InstanceId::from_string("ins-a")),
            &[],
            None,
            &clock,
        )
        .unwrap();
    assert_eq!(decision.instance_id, InstanceId::from_string("ins-a"));
    assert_eq!(decision.alternatives, vec![InstanceId::from_string("ins-b")]);
}

#[test]
fn instance_spread_quota_restricts_candidates() {
    let dir = tempdir().unwrap();
    let clock = FakeClock::new();
    let router = Router::new(RouterConfig::default());
    let board = breakers(&dir);

    let occupied_instance = healthy("ins-a", 1, 4);
    let fresh = healthy("ins-b", 0, 4);
    let occupied = vec![InstanceId::from_string("ins-a")];

    // Spread quota of 1 pins the tenant to its occupied instance.
    let decision = router
        .select(
            &task(),
            RuntimeKind::MicroVm,
            &[occupied_instance, fresh],
            &board,
            None,
            &occupied,
            Some(1),
            &clock,
        )
        .unwrap();
    assert_eq!(decision.instance_id, InstanceId::from_string("ins-a"));
}

#[test]
fn ties_break_on_smallest_id() {
    let dir = tempdir().unwrap();
    let clock = FakeClock::new();
    let router = Router::new(RouterConfig::default());
    let board = breakers(&dir);

    let twin_a = healthy("ins-aa", 1, 4);
    let twin_b = healthy("ins-ab", 1, 4);

    let decision = router
        .select(
            &task(),
            RuntimeKind::MicroVm,
            &[twin_b, twin_a],
            &board,
            None,
            &[],
            None,
            &clock,
        )
        .unwrap();
    assert_eq!(decision.instance_id, InstanceId::from_string("ins-aa"));
}

proptest! {
    /// Selection is deterministic: same inputs, same decision, regardless
    /// of instance ordering.
    #[test]
    fn selection_is_order_independent(seed in 0u64..1000) {
        let dir = tempdir().unwrap();
        let clock = FakeClock::new();
        let router = Router::new(RouterConfig::default());
        let board = breakers(&dir);

        let mut instances: Vec<Instance> = (0..6)
            .map(|n| healthy(&format!("ins-{n}"), ((seed + n) % 4) as u32, 4))
            .collect();

        let forward = router
            .select(&task(), RuntimeKind::MicroVm, &instances, &board, None, &[], None, &clock)
            .unwrap();
        instances.reverse();
        let reversed = router
            .select(&task(), RuntimeKind::MicroVm, &instances, &board, None, &[], None, &clock)
            .unwrap();

        prop_assert_eq!(forward.instance_id, reversed.instance_id);
        prop_assert_eq!(forward.score_milli, reversed.score_milli);
    }
}
