// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy surfaced at interface boundaries.
//!
//! Every failure that crosses a component boundary is classified into one of
//! these kinds. Internal error types (provider, storage, IO) never leak past
//! the engine; they are mapped here first.

use serde::{Deserialize, Serialize};

/// Failure kinds visible at interface boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed submission, unknown capability, deadline in the past
    InvalidInput,
    /// Fallback blocked or runtime kind disallowed by tenant policy
    PolicyDenied,
    /// Tenant or task cost ceiling hit
    BudgetExceeded,
    /// Router exhausted candidates
    NoEligibleInstance,
    /// Global backpressure rejected admission
    FederationCapacity,
    /// Circuit breaker blocked the call
    CircuitOpen,
    /// Spawn/exec timeout or instance lost mid-attempt
    TransientLocal,
    /// Remote sandbox 5xx or connection reset
    TransientRemote,
    /// Provider-reported irrecoverable error
    PermanentProvider,
    /// Task deadline passed
    DeadlineExceeded,
    /// Caller-initiated cancellation
    Cancelled,
    /// Fallback ladder consumed without success
    AllProvidersExhausted,
}

crate::simple_display! {
    ErrorKind {
        InvalidInput => "invalid_input",
        PolicyDenied => "policy_denied",
        BudgetExceeded => "budget_exceeded",
        NoEligibleInstance => "no_eligible_instance",
        FederationCapacity => "federation_capacity",
        CircuitOpen => "circuit_open",
        TransientLocal => "transient_local",
        TransientRemote => "transient_remote",
        PermanentProvider => "permanent_provider",
        DeadlineExceeded => "deadline_exceeded",
        Cancelled => "cancelled",
        AllProvidersExhausted => "all_providers_exhausted",
    }
}

/// What the retry machinery does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retry on the same runtime kind first (e.g. a remote 5xx)
    SameKind,
    /// Move on to the next runtime kind in the fallback ladder
    NextKind,
    /// Re-queue the task after a cooldown (capacity pressure)
    Cooldown,
    /// No retry; the failure is final
    Permanent,
}

impl ErrorKind {
    /// Whether the kind is retryable at any level (same kind, ladder, or cooldown).
    pub fn is_retryable(&self) -> bool {
        !matches!(self.retry_class(), RetryClass::Permanent)
    }

    /// Whether this kind may appear in a client-visible task outcome.
    ///
    /// Internal transient kinds only ever surface through attempt records.
    pub fn is_client_visible(&self) -> bool {
        !matches!(
            self,
            ErrorKind::CircuitOpen | ErrorKind::TransientLocal | ErrorKind::TransientRemote
        )
    }

    /// Classify the kind for the retry engine.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            ErrorKind::TransientRemote => RetryClass::SameKind,
            ErrorKind::TransientLocal | ErrorKind::CircuitOpen => RetryClass::NextKind,
            ErrorKind::NoEligibleInstance | ErrorKind::FederationCapacity => RetryClass::Cooldown,
            ErrorKind::InvalidInput
            | ErrorKind::PolicyDenied
            | ErrorKind::BudgetExceeded
            | ErrorKind::PermanentProvider
            | ErrorKind::DeadlineExceeded
            | ErrorKind::Cancelled
            | ErrorKind::AllProvidersExhausted => RetryClass::Permanent,
        }
    }
}

/// Client-visible task failure: the final kind plus a human message.
///
/// Never carries stack traces or provider internals; the only identifiers
/// permitted in `message` are task, attempt, and instance ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
