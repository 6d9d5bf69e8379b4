// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime kinds and provider capability flags.

use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Opaque handle to a provider session.
    ///
    /// The handle itself carries no provider state; all operations go through
    /// the provider that issued it, which owns the handle's resolution.
    pub struct SessionId("ses-");
}

crate::define_id! {
    /// Handle to a point-in-time session snapshot.
    pub struct SnapshotId("snp-");
}

/// The isolation flavor a worker instance offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// Isolated filesystem workspace on the worker host. No kernel boundary,
    /// no enforceable resource limits. Cheapest; weakest isolation.
    HostSandbox,
    /// Hardware-virtualized guest with its own kernel and enforced ceilings.
    /// Strongest isolation; highest setup cost.
    MicroVm,
    /// Execution delegated to an external service over authenticated RPC.
    RemoteSandbox,
}

crate::simple_display! {
    RuntimeKind {
        HostSandbox => "host-sandbox",
        MicroVm => "microvm",
        RemoteSandbox => "remote-sandbox",
    }
}

/// Default fallback ladder, strongest preference first.
pub const DEFAULT_LADDER: [RuntimeKind; 3] =
    [RuntimeKind::RemoteSandbox, RuntimeKind::MicroVm, RuntimeKind::HostSandbox];

impl RuntimeKind {
    /// Stable string key under which a provider factory is registered.
    pub fn key(&self) -> &'static str {
        match self {
            RuntimeKind::HostSandbox => "host-sandbox",
            RuntimeKind::MicroVm => "microvm",
            RuntimeKind::RemoteSandbox => "remote-sandbox",
        }
    }

    /// Parse a stable string key back into a kind.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "host-sandbox" => Some(RuntimeKind::HostSandbox),
            "microvm" => Some(RuntimeKind::MicroVm),
            "remote-sandbox" => Some(RuntimeKind::RemoteSandbox),
            _ => None,
        }
    }

    /// Relative isolation strength, higher is stronger.
    ///
    /// Used by the policy gate: a high-risk task must never descend to a
    /// kind with a lower rank than the kinds it was allowed to start with.
    pub fn isolation_rank(&self) -> u8 {
        match self {
            RuntimeKind::MicroVm => 3,
            RuntimeKind::RemoteSandbox => 2,
            RuntimeKind::HostSandbox => 1,
        }
    }
}

/// Feature flags a provider advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCaps {
    pub network_isolation: bool,
    pub fs_isolation: bool,
    pub snapshot: bool,
    pub resource_limits: bool,
    pub streaming_io: bool,
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
