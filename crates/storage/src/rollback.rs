// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entity rollback: reconstruct a prior version from the audit stream.
//!
//! Rollback is itself an audited transition, so the operation is replayable
//! and idempotent: repeating a rollback appends another entry with the same
//! payload and leaves the state unchanged.

use crate::audit_log::{AuditError, AuditLog};
use crate::checkpoint::Checkpoint;
use crate::state::MaterializedState;
use fm_core::{AuditEntry, EntityKind};
use std::path::Path;
use tracing::info;

/// Reconstruct the last audited version of an entity at or before
/// `target_seq`. Returns `None` when the entity has no entry in range.
pub fn reconstruct(
    log: &mut AuditLog,
    entity: EntityKind,
    entity_id: &str,
    target_seq: u64,
) -> Result<Option<AuditEntry>, AuditError> {
    let entries = log.entries_for(entity, entity_id, Some(target_seq))?;
    Ok(entries.into_iter().last())
}

/// Roll an entity back to its version at `target_seq`.
///
/// Writes a checkpoint of the current state first, then appends a new audit
/// entry carrying the reconstructed payload and applies it. Returns the
/// assigned sequence of the rollback entry, or `None` when no prior version
/// exists in range.
pub fn rollback(
    log: &mut AuditLog,
    state: &mut MaterializedState,
    checkpoint_path: &Path,
    entity: EntityKind,
    entity_id: &str,
    target_seq: u64,
    now_ms: u64,
) -> Result<Option<u64>, AuditError> {
    let Some(prior) = reconstruct(log, entity, entity_id, target_seq)? else {
        return Ok(None);
    };

    // Preserve the pre-rollback state before mutating anything.
    Checkpoint::new(now_ms, state.clone()).save(checkpoint_path)?;

    let current_state = current_state_label(state, entity, entity_id);
    let entry = AuditEntry::new(
        now_ms,
        entity,
        entity_id,
        current_state,
        prior.to_state.clone(),
        "rollback",
        Some(format!("rollback to seq {}", target_seq)),
        prior.payload.clone(),
    );

    let seq = log.append(entry.clone())?;
    log.flush()?;

    let mut applied = entry;
    applied.seq = seq;
    state.apply(&applied);

    info!(
        entity = %entity,
        entity_id,
        target_seq,
        seq,
        "rolled back entity to prior version"
    );

    Ok(Some(seq))
}

/// Best-effort label of the entity's current state, for the audit record.
fn current_state_label(state: &MaterializedState, entity: EntityKind, entity_id: &str) -> String {
    match entity {
        EntityKind::Task | EntityKind::Attempt => state
            .tasks
            .get(entity_id)
            .map(|t| t.state.to_string())
            .unwrap_or_else(|| "absent".into()),
        EntityKind::Instance => state
            .instances
            .get(entity_id)
            .map(|i| i.health.status.to_string())
            .unwrap_or_else(|| "absent".into()),
        EntityKind::TenantBudget => state
            .budgets
            .get(entity_id)
            .map(|b| format!("consumed:{}", b.consumed))
            .unwrap_or_else(|| "absent".into()),
        EntityKind::Breaker => state
            .breakers
            .get(entity_id)
            .map(|b| b.phase.to_string())
            .unwrap_or_else(|| "absent".into()),
    }
}

#[cfg(test)]
#[path = "rollback_tests.rs"]
mod tests;
