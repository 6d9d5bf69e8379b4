// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    invalid_input = { ErrorKind::InvalidInput, false },
    policy_denied = { ErrorKind::PolicyDenied, false },
    budget_exceeded = { ErrorKind::BudgetExceeded, false },
    no_eligible = { ErrorKind::NoEligibleInstance, true },
    federation_capacity = { ErrorKind::FederationCapacity, true },
    circuit_open = { ErrorKind::CircuitOpen, true },
    transient_local = { ErrorKind::TransientLocal, true },
    transient_remote = { ErrorKind::TransientRemote, true },
    permanent_provider = { ErrorKind::PermanentProvider, false },
    deadline = { ErrorKind::DeadlineExceeded, false },
    cancelled = { ErrorKind::Cancelled, false },
    exhausted = { ErrorKind::AllProvidersExhausted, false },
)]
fn retryability(kind: ErrorKind, retryable: bool) {
    assert_eq!(kind.is_retryable(), retryable);
}

#[test]
fn internal_kinds_are_not_client_visible() {
    assert!(!ErrorKind::CircuitOpen.is_client_visible());
    assert!(!ErrorKind::TransientLocal.is_client_visible());
    assert!(!ErrorKind::TransientRemote.is_client_visible());
    assert!(ErrorKind::BudgetExceeded.is_client_visible());
    assert!(ErrorKind::AllProvidersExhausted.is_client_visible());
}

#[test]
fn retry_classes() {
    assert_eq!(ErrorKind::TransientRemote.retry_class(), RetryClass::SameKind);
    assert_eq!(ErrorKind::TransientLocal.retry_class(), RetryClass::NextKind);
    assert_eq!(ErrorKind::CircuitOpen.retry_class(), RetryClass::NextKind);
    assert_eq!(ErrorKind::FederationCapacity.retry_class(), RetryClass::Cooldown);
    assert_eq!(ErrorKind::PolicyDenied.retry_class(), RetryClass::Permanent);
}

#[test]
fn serde_uses_snake_case_tags() {
    let json = serde_json::to_string(&ErrorKind::NoEligibleInstance).unwrap();
    assert_eq!(json, "\"no_eligible_instance\"");
}

#[test]
fn failure_display_includes_kind() {
    let failure = TaskFailure::new(ErrorKind::DeadlineExceeded, "deadline passed");
    assert_eq!(failure.to_string(), "deadline_exceeded: deadline passed");
}
