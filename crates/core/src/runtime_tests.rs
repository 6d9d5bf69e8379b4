// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn kind_key_round_trips() {
    for kind in [RuntimeKind::HostSandbox, RuntimeKind::MicroVm, RuntimeKind::RemoteSandbox] {
        assert_eq!(RuntimeKind::from_key(kind.key()), Some(kind));
    }
    assert_eq!(RuntimeKind::from_key("firecracker"), None);
}

#[test]
fn default_ladder_is_strongest_preference_first() {
    assert_eq!(
        DEFAULT_LADDER,
        [RuntimeKind::RemoteSandbox, RuntimeKind::MicroVm, RuntimeKind::HostSandbox]
    );
}

#[test]
fn microvm_is_strongest_isolation() {
    assert!(RuntimeKind::MicroVm.isolation_rank() > RuntimeKind::RemoteSandbox.isolation_rank());
    assert!(RuntimeKind::RemoteSandbox.isolation_rank() > RuntimeKind::HostSandbox.isolation_rank());
}

#[test]
fn kind_serde_uses_kebab_case() {
    let json = serde_json::to_string(&RuntimeKind::RemoteSandbox).unwrap();
    assert_eq!(json, "\"remote-sandbox\"");
}

#[test]
fn session_ids_have_prefix() {
    let id = SessionId::new();
    assert!(id.as_str().starts_with("ses-"));
}
