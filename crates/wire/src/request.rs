// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client → daemon requests.

use fm_core::{
    EntityKind, EventFilter, InstanceConfig, InstanceId, LoadSnapshot, TaskId, TaskSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Requests accepted on the daemon socket.
///
/// Serializes with `{"request": "name", ...fields}` format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    // -- submission API --
    SubmitTask {
        spec: TaskSpec,
    },
    CancelTask {
        id: TaskId,
    },
    GetTask {
        id: TaskId,
    },
    /// Switch this connection into an event stream; `Response::Event`
    /// frames follow until the client disconnects.
    SubscribeEvents {
        #[serde(default)]
        filter: EventFilter,
    },

    // -- worker registration API --
    RegisterInstance {
        config: InstanceConfig,
    },
    Heartbeat {
        id: InstanceId,
        load: LoadSnapshot,
        /// Full replacement capability set, when it changed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capabilities: Option<BTreeSet<String>>,
    },
    Deregister {
        id: InstanceId,
    },

    // -- introspection --
    Status,
    ListInstances,
    GetAudit {
        entity: EntityKind,
        entity_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_to: Option<u64>,
    },
    Rollback {
        entity: EntityKind,
        entity_id: String,
        target_seq: u64,
    },
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;
