// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::audit_log::AuditLog;
use fm_core::{Task, TaskId, TaskSpec, TaskState};
use tempfile::tempdir;

fn append_task_version(log: &mut AuditLog, state: &mut MaterializedState, task_state: TaskState) {
    let mut task = Task::new(TaskId::from_string("tsk-r1"), TaskSpec::builder().build(), 0);
    task.state = task_state;
    let entry = fm_core::AuditEntry::new(
        1_000,
        EntityKind::Task,
        "tsk-r1",
        "x",
        task_state.to_string(),
        "lifecycle",
        None,
        serde_json::to_value(&task).unwrap(),
    );
    let seq = log.append(entry.clone()).unwrap();
    let mut applied = entry;
    applied.seq = seq;
    state.apply(&applied);
}

#[test]
fn reconstruct_picks_last_version_in_range() {
    let dir = tempdir().unwrap();
    let mut log = AuditLog::open(&dir.path().join("audit.log")).unwrap();
    let mut state = MaterializedState::new();

    append_task_version(&mut log, &mut state, TaskState::Admitted); // seq 1
    append_task_version(&mut log, &mut state, TaskState::Dispatched); // seq 2
    append_task_version(&mut log, &mut state, TaskState::Running); // seq 3

    let prior = reconstruct(&mut log, EntityKind::Task, "tsk-r1", 2).unwrap().unwrap();
    assert_eq!(prior.seq, 2);
    assert_eq!(prior.to_state, "dispatched");

    assert!(reconstruct(&mut log, EntityKind::Task, "tsk-r2", 99).unwrap().is_none());
}

#[test]
fn rollback_restores_prior_version_and_audits_itself() {
    let dir = tempdir().unwrap();
    let checkpoint_path = dir.path().join("checkpoint.zst");
    let mut log = AuditLog::open(&dir.path().join("audit.log")).unwrap();
    let mut state = MaterializedState::new();

    append_task_version(&mut log, &mut state, TaskState::Admitted); // seq 1
    append_task_version(&mut log, &mut state, TaskState::Running); // seq 2
    assert_eq!(state.get_task("tsk-r1").unwrap().state, TaskState::Running);

    let seq = rollback(
        &mut log,
        &mut state,
        &checkpoint_path,
        EntityKind::Task,
        "tsk-r1",
        1,
        9_000,
    )
    .unwrap()
    .unwrap();

    assert_eq!(seq, 3);
    assert_eq!(state.get_task("tsk-r1").unwrap().state, TaskState::Admitted);

    // A checkpoint of the pre-rollback state was written first.
    let checkpoint = Checkpoint::load(&checkpoint_path).unwrap().unwrap();
    assert_eq!(checkpoint.state.get_task("tsk-r1").unwrap().state, TaskState::Running);

    // The rollback itself is on the audit stream.
    let entries = log.entries_for(EntityKind::Task, "tsk-r1", None).unwrap();
    assert_eq!(entries.last().unwrap().actor, "rollback");
}

#[test]
fn rollback_is_idempotent() {
    let dir = tempdir().unwrap();
    let checkpoint_path = dir.path().join("checkpoint.zst");
    let mut log = AuditLog::open(&dir.path().join("audit.log")).unwrap();
    let mut state = MaterializedState::new();

    append_task_version(&mut log, &mut state, TaskState::Admitted);
    append_task_version(&mut log, &mut state, TaskState::Running);

    rollback(&mut log, &mut state, &checkpoint_path, EntityKind::Task, "tsk-r1", 1, 9_000)
        .unwrap();
    let after_first = state.clone();
    rollback(&mut log, &mut state, &checkpoint_path, EntityKind::Task, "tsk-r1", 1, 9_001)
        .unwrap();

    assert_eq!(
        state.get_task("tsk-r1").unwrap().state,
        after_first.get_task("tsk-r1").unwrap().state
    );
    assert_eq!(state.tasks.len(), after_first.tasks.len());
}

#[test]
fn rollback_missing_entity_is_a_noop() {
    let dir = tempdir().unwrap();
    let checkpoint_path = dir.path().join("checkpoint.zst");
    let mut log = AuditLog::open(&dir.path().join("audit.log")).unwrap();
    let mut state = MaterializedState::new();

    let result = rollback(
        &mut log,
        &mut state,
        &checkpoint_path,
        EntityKind::Task,
        "tsk-none",
        5,
        9_000,
    )
    .unwrap();

    assert!(result.is_none());
    assert!(!checkpoint_path.exists());
}
