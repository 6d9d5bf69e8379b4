// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn display_includes_instance_when_present() {
    let provider_wide = BreakerKey::provider(RuntimeKind::RemoteSandbox);
    assert_eq!(provider_wide.to_string(), "remote-sandbox");

    let per_instance =
        BreakerKey::instance(RuntimeKind::RemoteSandbox, InstanceId::from_string("ins-b1"));
    assert_eq!(per_instance.to_string(), "remote-sandbox/ins-b1");
}

#[test]
fn phase_defaults_to_closed() {
    assert_eq!(BreakerPhase::default(), BreakerPhase::Closed);
}

#[test]
fn snapshot_serde_round_trip() {
    let snapshot = BreakerSnapshot {
        key: BreakerKey::instance(RuntimeKind::MicroVm, InstanceId::from_string("ins-b2")),
        phase: BreakerPhase::Open,
        failure_count: 5,
        last_failure_ms: Some(1_000),
        opened_at_ms: Some(1_000),
        schema_version: 1,
    };
    let json = serde_json::to_string(&snapshot).unwrap();
    let back: BreakerSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(back, snapshot);
}
