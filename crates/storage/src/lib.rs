// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! fm-storage: durable audit log, checkpoints, and replayed state.
//!
//! The audit log is the system's write-ahead log: every durable state
//! transition is appended here before the in-memory mutation is published.
//! Recovery is checkpoint + replay; rollback reconstructs a prior entity
//! version from the same entries.

mod audit_log;
mod checkpoint;
mod rollback;
mod state;

pub use audit_log::{AuditError, AuditLog};
pub use checkpoint::{rotate_bak_path, Checkpoint};
pub use rollback::{reconstruct, rollback};
pub use state::{AttemptRecord, MaterializedState};
