// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breaker phases and the durable breaker record.
//!
//! The live state machine (thresholds, half-open probe admission) is owned
//! by the engine; this module holds the shared vocabulary and the snapshot
//! form that reaches the audit log.

use crate::instance::InstanceId;
use crate::runtime::RuntimeKind;
use serde::{Deserialize, Serialize};

/// Breaker state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BreakerPhase {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

crate::simple_display! {
    BreakerPhase {
        Closed => "closed",
        Open => "open",
        HalfOpen => "half_open",
    }
}

/// Identifier under which breaker state is tracked.
///
/// Failures are isolated both per worker (`kind + instance`) and per
/// provider (`kind` alone); callers consult both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreakerKey {
    pub kind: RuntimeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
}

impl BreakerKey {
    pub fn provider(kind: RuntimeKind) -> Self {
        Self { kind, instance_id: None }
    }

    pub fn instance(kind: RuntimeKind, instance_id: InstanceId) -> Self {
        Self { kind, instance_id: Some(instance_id) }
    }
}

impl std::fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.instance_id {
            Some(instance) => write!(f, "{}/{}", self.kind, instance),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Durable breaker record, audited on every phase transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub key: BreakerKey,
    pub phase: BreakerPhase,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at_ms: Option<u64>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    1
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
