// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::instance::HealthStatus;

#[test]
fn unhealthy_instance_never_accepts_dispatch() {
    let instance = Instance::builder()
        .health(HealthState {
            status: HealthStatus::Unhealthy,
            last_probe_ms: 1,
            last_error: Some("probe failed".into()),
        })
        .build();
    assert!(!instance.accepts_dispatch());
}

#[test]
fn degraded_instance_still_accepts_dispatch() {
    let instance = Instance::builder()
        .health(HealthState { status: HealthStatus::Degraded, last_probe_ms: 1, last_error: None })
        .build();
    assert!(instance.accepts_dispatch());
}

#[test]
fn draining_instance_takes_no_new_work() {
    let instance = Instance::builder().drain_deadline_ms(9_999u64).build();
    assert!(instance.is_draining());
    assert!(!instance.accepts_dispatch());
}

#[test]
fn capacity_boundary_at_max_sessions() {
    let mut instance = Instance::builder()
        .ceilings(ResourceCeilings { max_sessions: 4, ..ResourceCeilings::default() })
        .build();

    instance.load.active_sessions = 3;
    assert!(instance.has_capacity());

    instance.load.active_sessions = 4;
    assert!(!instance.has_capacity());
}

#[test]
fn session_util_is_bounded() {
    let mut instance = Instance::builder()
        .ceilings(ResourceCeilings { max_sessions: 4, ..ResourceCeilings::default() })
        .build();
    instance.load.active_sessions = 2;
    assert!((instance.session_util() - 0.5).abs() < f64::EPSILON);

    instance.ceilings.max_sessions = 0;
    assert!((instance.session_util() - 1.0).abs() < f64::EPSILON);
}

#[test]
fn offers_checks_runtime_kinds() {
    let instance = Instance::builder()
        .runtime_kinds(vec![RuntimeKind::MicroVm, RuntimeKind::RemoteSandbox])
        .build();
    assert!(instance.offers(RuntimeKind::MicroVm));
    assert!(!instance.offers(RuntimeKind::HostSandbox));
}

#[test]
fn from_config_starts_unknown_and_unloaded() {
    let config = InstanceConfig {
        id: InstanceId::from_string("ins-cfg"),
        endpoint: "10.0.0.1:7070".into(),
        capabilities: BTreeSet::from(["code".to_string()]),
        ceilings: ResourceCeilings::default(),
        region: "eu-west".into(),
        runtime_kinds: vec![RuntimeKind::MicroVm],
    };
    let instance = Instance::from_config(config, 1_234);
    assert_eq!(instance.health.status, HealthStatus::Unknown);
    assert_eq!(instance.load.active_sessions, 0);
    assert_eq!(instance.registered_at_ms, 1_234);
    assert!(instance.drain_deadline_ms.is_none());
}

#[test]
fn instance_serde_round_trip() {
    let instance = Instance::builder().region("us-east").build();
    let json = serde_json::to_string(&instance).unwrap();
    let back: Instance = serde_json::from_str(&json).unwrap();
    assert_eq!(back, instance);
}
