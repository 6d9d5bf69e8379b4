// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the engine runtime

use fm_storage::AuditError;
use thiserror::Error;

/// Errors that can occur in the engine.
///
/// These are internal; the client-visible surface is the task-failure
/// taxonomy in fm-core.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] AuditError),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("registration conflict for {id}: {detail}")]
    RegistrationConflict { id: String, detail: String },
}
