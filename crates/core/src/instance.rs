// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker instance records: membership, health, and load signals.

use crate::runtime::RuntimeKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

crate::define_id! {
    /// Unique identifier for a registered worker instance.
    pub struct InstanceId("ins-");
}

/// Resource ceilings declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCeilings {
    pub cpu_millis: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub max_sessions: u32,
    pub max_queued: u32,
}

impl Default for ResourceCeilings {
    fn default() -> Self {
        Self { cpu_millis: 4000, memory_mb: 8192, disk_mb: 32768, max_sessions: 4, max_queued: 16 }
    }
}

/// Liveness classification for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// Registered but not yet probed
    Unknown,
}

crate::simple_display! {
    HealthStatus {
        Healthy => "healthy",
        Degraded => "degraded",
        Unhealthy => "unhealthy",
        Unknown => "unknown",
    }
}

/// Health status together with the probe evidence behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatus,
    /// Epoch milliseconds of the most recent probe (0 when never probed)
    #[serde(default)]
    pub last_probe_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self { status: HealthStatus::Unknown, last_probe_ms: 0, last_error: None }
    }
}

/// Point-in-time load report, updated on heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    /// CPU utilization in [0, 1]
    pub cpu_util: f64,
    /// Memory utilization in [0, 1]
    pub mem_util: f64,
    pub active_sessions: u32,
    pub queued_tasks: u32,
    pub last_updated_ms: u64,
}

impl Default for LoadSnapshot {
    fn default() -> Self {
        Self { cpu_util: 0.0, mem_util: 0.0, active_sessions: 0, queued_tasks: 0, last_updated_ms: 0 }
    }
}

/// Registration payload for a worker instance.
///
/// Registration is idempotent by id; re-registering with a conflicting
/// endpoint or runtime kind set is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: InstanceId,
    /// Network endpoint, `host:port`
    pub endpoint: String,
    pub capabilities: BTreeSet<String>,
    pub ceilings: ResourceCeilings,
    #[serde(default)]
    pub region: String,
    pub runtime_kinds: Vec<RuntimeKind>,
}

/// A registered worker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub endpoint: String,
    pub capabilities: BTreeSet<String>,
    pub ceilings: ResourceCeilings,
    #[serde(default)]
    pub region: String,
    pub runtime_kinds: Vec<RuntimeKind>,
    pub registered_at_ms: u64,
    #[serde(default)]
    pub health: HealthState,
    #[serde(default)]
    pub load: LoadSnapshot,
    /// Set when the instance is draining; no new dispatch past this point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_deadline_ms: Option<u64>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    1
}

impl Instance {
    pub fn from_config(config: InstanceConfig, registered_at_ms: u64) -> Self {
        Self {
            id: config.id,
            endpoint: config.endpoint,
            capabilities: config.capabilities,
            ceilings: config.ceilings,
            region: config.region,
            runtime_kinds: config.runtime_kinds,
            registered_at_ms,
            health: HealthState::default(),
            load: LoadSnapshot::default(),
            drain_deadline_ms: None,
            schema_version: 1,
        }
    }

    /// Whether the instance is draining (deregistered, tasks finishing up).
    pub fn is_draining(&self) -> bool {
        self.drain_deadline_ms.is_some()
    }

    /// Whether new work may be dispatched here at all.
    ///
    /// Unhealthy instances are never candidates; draining instances take no
    /// new work regardless of health.
    pub fn accepts_dispatch(&self) -> bool {
        !self.is_draining()
            && matches!(self.health.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Whether the instance has a free session slot.
    pub fn has_capacity(&self) -> bool {
        self.load.active_sessions < self.ceilings.max_sessions
    }

    /// Whether the instance offers the given runtime kind.
    pub fn offers(&self, kind: RuntimeKind) -> bool {
        self.runtime_kinds.contains(&kind)
    }

    /// Session-slot utilization in [0, 1].
    pub fn session_util(&self) -> f64 {
        if self.ceilings.max_sessions == 0 {
            return 1.0;
        }
        f64::from(self.load.active_sessions) / f64::from(self.ceilings.max_sessions)
    }

    /// Queue depth normalized against the declared ceiling, in [0, 1].
    pub fn queue_norm(&self) -> f64 {
        if self.ceilings.max_queued == 0 {
            return 1.0;
        }
        (f64::from(self.load.queued_tasks) / f64::from(self.ceilings.max_queued)).min(1.0)
    }
}

crate::builder! {
    pub struct InstanceBuilder => Instance {
        into {
            id: InstanceId = "ins-test1",
            endpoint: String = "127.0.0.1:7070",
            region: String = "",
        }
        set {
            capabilities: BTreeSet<String> = BTreeSet::new(),
            ceilings: ResourceCeilings = ResourceCeilings::default(),
            runtime_kinds: Vec<RuntimeKind> = vec![RuntimeKind::HostSandbox],
            registered_at_ms: u64 = 1_000_000,
            health: HealthState = HealthState {
                status: HealthStatus::Healthy,
                last_probe_ms: 1_000_000,
                last_error: None,
            },
            load: LoadSnapshot = LoadSnapshot::default(),
            schema_version: u32 = 1,
        }
        option {
            drain_deadline_ms: u64 = None,
        }
    }
}

#[cfg(test)]
#[path = "instance_tests.rs"]
mod tests;
