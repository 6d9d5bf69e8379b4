// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Write-ahead discipline for durable transitions.
//!
//! Every durable mutation funnels through [`Auditor::record`]: the audit
//! entry is appended (and flushed synchronously when any published event is
//! audit-flagged) *before* the state mutation becomes visible, and only
//! then are bus events published.

use crate::error::EngineError;
use fm_core::{AuditEntry, Event, EventSink};
use fm_storage::{AuditLog, MaterializedState};
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared append-apply-publish pipeline.
#[derive(Clone)]
pub struct Auditor {
    log: Arc<Mutex<AuditLog>>,
    state: Arc<Mutex<MaterializedState>>,
    sink: Arc<dyn EventSink>,
}

impl Auditor {
    pub fn new(
        log: Arc<Mutex<AuditLog>>,
        state: Arc<Mutex<MaterializedState>>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self { log, state, sink }
    }

    pub fn state(&self) -> &Arc<Mutex<MaterializedState>> {
        &self.state
    }

    pub fn log(&self) -> &Arc<Mutex<AuditLog>> {
        &self.log
    }

    /// Record one durable transition: append, apply, publish.
    ///
    /// Returns the assigned audit sequence.
    pub fn record(&self, entry: AuditEntry, events: Vec<Event>) -> Result<u64, EngineError> {
        let must_flush = events.iter().any(|e| e.is_audit());

        let seq = {
            let mut log = self.log.lock();
            let seq = log.append(entry.clone())?;
            if must_flush {
                log.flush()?;
            }
            seq
        };

        let mut applied = entry;
        applied.seq = seq;
        self.state.lock().apply(&applied);

        for event in events {
            self.sink.publish(event);
        }

        Ok(seq)
    }

    /// Publish events that carry no durable transition of their own.
    pub fn publish(&self, event: Event) {
        self.sink.publish(event);
    }

    /// Read a value out of the shared state.
    pub fn with_state<T>(&self, f: impl FnOnce(&MaterializedState) -> T) -> T {
        f(&self.state.lock())
    }

    /// Mutate volatile (non-audited) state directly: load snapshots and
    /// other heartbeat-frequency signals that are not durable transitions.
    pub fn with_state_mut<T>(&self, f: impl FnOnce(&mut MaterializedState) -> T) -> T {
        f(&mut self.state.lock())
    }

    /// Flush buffered audit entries if the group-commit window elapsed.
    pub fn maybe_flush(&self) -> Result<(), EngineError> {
        let mut log = self.log.lock();
        if log.needs_flush() {
            log.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
