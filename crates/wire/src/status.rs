// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Status DTO for `fm status`.

use fm_core::TelemetrySnapshot;
use serde::{Deserialize, Serialize};

/// Daemon-level status report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub uptime_ms: u64,
    pub instances_total: usize,
    pub instances_healthy: usize,
    pub instances_degraded: usize,
    pub instances_unhealthy: usize,
    /// Global session-slot utilization in [0, 1]
    pub utilization: f64,
    pub queued_tasks: usize,
    pub active_tasks: usize,
    pub telemetry: TelemetrySnapshot,
}
