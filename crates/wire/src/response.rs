// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon → client responses.

use crate::status::StatusReport;
use fm_core::{AuditEntry, Event, Instance, InstanceId, Task, TaskFailure, TaskId};
use serde::{Deserialize, Serialize};

/// Responses written on the daemon socket.
///
/// Serializes with `{"response": "name", ...fields}` format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    /// Generic success with no payload
    Ok,
    /// Request-level failure; `failure` carries the boundary taxonomy for
    /// task rejections, `message` is human-readable in every case.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<TaskFailure>,
    },

    TaskSubmitted {
        id: TaskId,
    },
    Task {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<Box<Task>>,
    },
    InstanceRegistered {
        id: InstanceId,
    },
    Instances {
        instances: Vec<Instance>,
    },
    Status {
        report: Box<StatusReport>,
    },
    Audit {
        entries: Vec<AuditEntry>,
    },
    RolledBack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    /// Acknowledges a subscription; `Event` frames follow.
    Subscribed,
    Event {
        event: Event,
    },
}

#[cfg(test)]
#[path = "response_tests.rs"]
mod tests;
