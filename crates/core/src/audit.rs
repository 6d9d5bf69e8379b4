// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Audit entries: the durable, totally ordered record of state transitions.
//!
//! Every durable transition for Instance, Task, Attempt, TenantBudget, and
//! BreakerState produces an entry *before* the in-memory mutation becomes
//! visible to other components. The payload carries the post-transition
//! snapshot of the entity, which makes replay and rollback a matter of
//! re-applying payloads in sequence order.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Schema version stamped on every entry.
pub const AUDIT_SCHEMA_VERSION: u32 = 1;

/// Durable entity families covered by the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Instance,
    Task,
    Attempt,
    TenantBudget,
    Breaker,
}

crate::simple_display! {
    EntityKind {
        Instance => "instance",
        Task => "task",
        Attempt => "attempt",
        TenantBudget => "tenant_budget",
        Breaker => "breaker",
    }
}

/// One append-only audit record.
///
/// `seq` is assigned by the audit log at append time and is strictly
/// monotonically increasing across all entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(default)]
    pub seq: u64,
    pub ts_ms: u64,
    pub entity: EntityKind,
    pub entity_id: String,
    pub from_state: String,
    pub to_state: String,
    /// Component that drove the transition ("lifecycle", "registry", ...)
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Post-transition entity snapshot (Null for removals)
    pub payload: serde_json::Value,
    pub payload_hash: String,
    pub schema_version: u32,
}

impl AuditEntry {
    /// Build an entry with the payload hash computed. `seq` stays 0 until
    /// the audit log assigns it.
    pub fn new(
        ts_ms: u64,
        entity: EntityKind,
        entity_id: impl Into<String>,
        from_state: impl Into<String>,
        to_state: impl Into<String>,
        actor: impl Into<String>,
        reason: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        let payload_hash = Self::hash_payload(&payload);
        Self {
            seq: 0,
            ts_ms,
            entity,
            entity_id: entity_id.into(),
            from_state: from_state.into(),
            to_state: to_state.into(),
            actor: actor.into(),
            reason,
            payload,
            payload_hash,
            schema_version: AUDIT_SCHEMA_VERSION,
        }
    }

    /// Hex SHA-256 of the canonical JSON serialization of the payload.
    pub fn hash_payload(payload: &serde_json::Value) -> String {
        let canonical = payload.to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{:x}", digest)
    }

    /// Verify the stored hash against the stored payload.
    pub fn payload_intact(&self) -> bool {
        Self::hash_payload(&self.payload) == self.payload_hash
    }
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
