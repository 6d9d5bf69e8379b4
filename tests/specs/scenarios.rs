// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The end-to-end federation scenarios.

use super::harness::Federation;
use fm_core::{
    AttemptOutcome, BudgetScope, Clock, ErrorKind, Event, HealthStatus, RuntimeKind, StaticPolicy,
    TaskState,
};
use fm_providers::ProviderError;
use std::sync::Arc;

#[tokio::test]
async fn happy_path_single_attempt() {
    let f = Federation::new();
    f.add_instance("ins-1", vec![RuntimeKind::MicroVm], &["code"], 4);

    let mut spec = Federation::spec();
    spec.required_capabilities = vec!["code".into()];
    let task_id = f.runtime.submit_task(spec).unwrap();
    f.settle().await;

    let task = f.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempts.len(), 1);

    assert_eq!(
        f.task_events(&task_id),
        vec!["task:submitted", "task:admitted", "task:routed", "task:started", "task:completed"]
    );
}

#[tokio::test]
async fn fallback_after_transient_failures_opens_breaker() {
    let f = Federation::new();
    f.add_instance("ins-remote", vec![RuntimeKind::RemoteSandbox], &[], 4);
    f.add_instance("ins-micro", vec![RuntimeKind::MicroVm], &[], 4);

    for _ in 0..3 {
        f.remote.push_spawn_error(ProviderError::Connection("connection reset".into()));
    }

    let task_id = f.runtime.submit_task(Federation::spec()).unwrap();
    f.settle().await;

    let task = f.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempts.len(), 4);
    for attempt in &task.attempts[..3] {
        assert_eq!(attempt.runtime_kind, RuntimeKind::RemoteSandbox);
        assert_eq!(attempt.error_kind, Some(ErrorKind::TransientRemote));
    }
    assert_eq!(task.attempts[3].runtime_kind, RuntimeKind::MicroVm);
    assert_eq!(task.attempts[3].outcome, AttemptOutcome::Ok);

    // Subsequent tasks route around the opened breaker.
    let next = f.runtime.submit_task(Federation::spec()).unwrap();
    f.settle().await;
    let next = f.runtime.get_task(&next).unwrap();
    assert_eq!(next.state, TaskState::Succeeded);
    assert_eq!(next.attempts.len(), 1);
    assert_eq!(next.attempts[0].runtime_kind, RuntimeKind::MicroVm);
}

#[tokio::test]
async fn policy_blocks_fallback_for_high_risk_task() {
    let f = Federation::with_policy(Arc::new(StaticPolicy::new().high_risk("tenant-a")));
    f.add_instance("ins-remote", vec![RuntimeKind::RemoteSandbox], &[], 4);
    f.add_instance("ins-micro", vec![RuntimeKind::MicroVm], &[], 4);
    f.add_instance("ins-host", vec![RuntimeKind::HostSandbox], &[], 4);

    for _ in 0..6 {
        f.remote.push_spawn_error(ProviderError::SpawnFailed("spawn timeout".into()));
        f.micro.push_spawn_error(ProviderError::SpawnFailed("spawn timeout".into()));
    }

    let task_id = f.runtime.submit_task(Federation::spec()).unwrap();
    f.settle().await;

    let task = f.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.failure.as_ref().unwrap().kind, ErrorKind::AllProvidersExhausted);
    assert!(f.task_events(&task_id).contains(&"task:fallback_blocked"));
    // The host sandbox never saw the task.
    assert!(f.host.calls().is_empty());
}

#[tokio::test]
async fn global_backpressure_rejects_submission() {
    let f = Federation::new();
    for n in 0..10 {
        f.add_instance(&format!("ins-{n}"), vec![RuntimeKind::MicroVm], &[], 25);
    }
    f.runtime.auditor().with_state_mut(|state| {
        for instance in state.instances.values_mut() {
            instance.load.active_sessions = 24; // 96% everywhere
        }
    });

    let failure = f.runtime.submit_task(Federation::spec()).unwrap_err();
    assert_eq!(failure.kind, ErrorKind::FederationCapacity);
    assert_eq!(
        f.runtime.telemetry().rejected_count("federation_capacity"),
        1
    );

    let task = f
        .runtime
        .auditor()
        .with_state(|state| state.tasks.values().next().cloned())
        .unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.attempts.is_empty());
}

#[tokio::test]
async fn budget_enforcement_rejects_over_limit_estimate() {
    let f = Federation::new();
    f.add_instance("ins-1", vec![RuntimeKind::MicroVm], &[], 4);

    // Daily limit 1000 units, 950 already consumed.
    f.runtime
        .budgets()
        .set_budget("tenant-a", BudgetScope::Daily, 1_000, &f.clock)
        .unwrap();
    f.runtime.budgets().admit("tenant-a", 950, 0, false, &f.clock).unwrap();

    let mut spec = Federation::spec();
    spec.cost_estimate = 75;
    let failure = f.runtime.submit_task(spec).unwrap_err();
    assert_eq!(failure.kind, ErrorKind::BudgetExceeded);

    // The critical-threshold alert is on the stream.
    let alerted: Vec<u8> = f
        .sink
        .0
        .lock()
        .iter()
        .filter_map(|e| match e {
            Event::BudgetAlert { threshold_pct, .. } => Some(*threshold_pct),
            _ => None,
        })
        .collect();
    assert!(alerted.contains(&90));
}

#[tokio::test]
async fn cancellation_before_dispatch_and_idempotence() {
    let f = Federation::new();
    // No instances: the task parks after admission.
    let task_id = f.runtime.submit_task(Federation::spec()).unwrap();
    f.settle().await;

    f.runtime.cancel_task(&task_id).unwrap();
    let task = f.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert!(task.attempts.is_empty());
    assert!(f.task_events(&task_id).contains(&"task:cancelled"));

    // cancel is a no-op on terminal states.
    f.runtime.cancel_task(&task_id).unwrap();
    assert_eq!(f.runtime.get_task(&task_id).unwrap().state, TaskState::Cancelled);
}

#[tokio::test]
async fn cancellation_during_running_destroys_the_session() {
    let f = Federation::new();
    f.add_instance("ins-1", vec![RuntimeKind::MicroVm], &[], 4);
    f.micro.set_exec_delay(std::time::Duration::from_secs(30));

    let task_id = f.runtime.submit_task(Federation::spec()).unwrap();

    // Drive the loop until the attempt is executing.
    for _ in 0..200 {
        f.runtime.run_pending().await.unwrap();
        if f.runtime.get_task(&task_id).unwrap().state == TaskState::Running {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    assert_eq!(f.runtime.get_task(&task_id).unwrap().state, TaskState::Running);

    f.runtime.cancel_task(&task_id).unwrap();
    f.settle().await;

    let task = f.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Cancelled);
    assert_eq!(task.attempts.len(), 1);
    assert_eq!(task.attempts[0].outcome, AttemptOutcome::Cancelled);
    // The provider confirmed the destroy within grace.
    assert_eq!(f.micro.destroyed().len(), 1);
    assert!(f.task_events(&task_id).contains(&"task:cancelled"));
}

#[tokio::test]
async fn instance_loss_fails_over_to_another_instance() {
    let f = Federation::new();
    f.add_instance("ins-a", vec![RuntimeKind::MicroVm], &[], 4);
    f.add_instance("ins-b", vec![RuntimeKind::MicroVm], &[], 4);

    // Simulate a task interrupted mid-run on ins-a (as after a crash).
    let task_id = {
        let mut task =
            fm_core::Task::new(fm_core::TaskId::new(), Federation::spec(), f.clock.epoch_ms());
        task.state = TaskState::Running;
        task.admitted_at_ms = Some(f.clock.epoch_ms());
        task.push_attempt(
            fm_core::InstanceId::from_string("ins-a"),
            RuntimeKind::MicroVm,
            f.clock.epoch_ms(),
        );
        let id = task.id;
        f.runtime
            .auditor()
            .with_state_mut(|state| state.tasks.insert(id.to_string(), task));
        id
    };

    f.runtime.recover().unwrap();
    f.settle().await;

    let task = f.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(task.attempts[0].error_kind, Some(ErrorKind::TransientLocal));
    assert!(task.attempts.len() >= 2);
}

#[tokio::test]
async fn degraded_instance_used_only_without_healthy_candidates() {
    let f = Federation::new();
    f.add_instance("ins-good", vec![RuntimeKind::MicroVm], &[], 4);
    f.add_instance("ins-meh", vec![RuntimeKind::MicroVm], &[], 4);
    f.runtime.auditor().with_state_mut(|state| {
        if let Some(instance) = state.instances.get_mut("ins-meh") {
            instance.health.status = HealthStatus::Degraded;
        }
    });

    let task_id = f.runtime.submit_task(Federation::spec()).unwrap();
    f.settle().await;
    let task = f.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.attempts[0].instance_id, fm_core::InstanceId::from_string("ins-good"));

    // Degrade the good one too; now the degraded instance is acceptable.
    f.runtime.auditor().with_state_mut(|state| {
        if let Some(instance) = state.instances.get_mut("ins-good") {
            instance.health.status = HealthStatus::Unhealthy;
        }
    });
    let task_id = f.runtime.submit_task(Federation::spec()).unwrap();
    f.settle().await;
    let task = f.runtime.get_task(&task_id).unwrap();
    assert_eq!(task.attempts[0].instance_id, fm_core::InstanceId::from_string("ins-meh"));
}

#[tokio::test]
async fn workspace_affinity_prefers_previous_instance() {
    let f = Federation::new();
    f.add_instance("ins-a", vec![RuntimeKind::MicroVm], &[], 4);
    f.add_instance("ins-b", vec![RuntimeKind::MicroVm], &[], 4);

    let mut first = Federation::spec();
    first.workspace = Some("ws-shared".into());
    let first_id = f.runtime.submit_task(first).unwrap();
    f.settle().await;
    let chosen = f.runtime.get_task(&first_id).unwrap().attempts[0].instance_id;

    // A follow-up task for the same workspace lands on the same instance.
    let mut second = Federation::spec();
    second.workspace = Some("ws-shared".into());
    let second_id = f.runtime.submit_task(second).unwrap();
    f.settle().await;
    assert_eq!(f.runtime.get_task(&second_id).unwrap().attempts[0].instance_id, chosen);
}
