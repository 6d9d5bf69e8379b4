// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use fm_core::{AuditEntry, EntityKind, Instance};
use tempfile::tempdir;

fn populated_state() -> MaterializedState {
    let mut state = MaterializedState::new();
    let instance = Instance::builder().id("ins-c1").build();
    let mut entry = AuditEntry::new(
        1_000,
        EntityKind::Instance,
        "ins-c1",
        "unknown",
        "healthy",
        "registry",
        None,
        serde_json::to_value(&instance).unwrap(),
    );
    entry.seq = 7;
    state.apply(&entry);
    state
}

#[test]
fn save_and_load_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoint.zst");

    let checkpoint = Checkpoint::new(5_000, populated_state());
    checkpoint.save(&path).unwrap();

    let loaded = Checkpoint::load(&path).unwrap().unwrap();
    assert_eq!(loaded.taken_at_ms, 5_000);
    assert_eq!(loaded.applied_seq(), 7);
    similar_asserts::assert_eq!(loaded.state, checkpoint.state);
}

#[test]
fn load_missing_returns_none() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing.zst");
    assert!(Checkpoint::load(&path).unwrap().is_none());
}

#[test]
fn corrupt_checkpoint_is_rotated_and_treated_as_missing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoint.zst");
    std::fs::write(&path, b"not zstd at all").unwrap();

    assert!(Checkpoint::load(&path).unwrap().is_none());
    assert!(!path.exists());
    assert!(dir.path().join("checkpoint.bak").exists());
}

#[test]
fn bak_rotation_finds_free_slot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("audit.log");
    std::fs::write(dir.path().join("audit.bak"), b"x").unwrap();

    let next = rotate_bak_path(&path);
    assert_eq!(next, dir.path().join("audit.bak1"));
}
