// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use fm_core::TaskId;
use std::time::Duration;

#[test]
fn timers_fire_once_due() {
    let mut scheduler = Scheduler::new();
    let now = Instant::now();
    let task = TaskId::from_string("tsk-a");

    scheduler.set_timer(TimerKind::TaskDeadline(task), Duration::from_secs(5), now);
    assert!(scheduler.fired_timers(now).is_empty());

    let fired = scheduler.fired_timers(now + Duration::from_secs(5));
    assert_eq!(fired, vec![TimerKind::TaskDeadline(task)]);

    // Fired timers are consumed.
    assert!(scheduler.fired_timers(now + Duration::from_secs(10)).is_empty());
}

#[test]
fn setting_same_kind_resets_deadline() {
    let mut scheduler = Scheduler::new();
    let now = Instant::now();

    scheduler.set_timer(TimerKind::ProbeCycle, Duration::from_secs(1), now);
    scheduler.set_timer(TimerKind::ProbeCycle, Duration::from_secs(10), now);

    assert!(scheduler.fired_timers(now + Duration::from_secs(5)).is_empty());
    assert_eq!(
        scheduler.fired_timers(now + Duration::from_secs(10)),
        vec![TimerKind::ProbeCycle]
    );
}

#[test]
fn cancel_task_timers_clears_only_that_task() {
    let mut scheduler = Scheduler::new();
    let now = Instant::now();
    let a = TaskId::from_string("tsk-a");
    let b = TaskId::from_string("tsk-b");

    scheduler.set_timer(TimerKind::TaskDeadline(a), Duration::from_secs(1), now);
    scheduler.set_timer(TimerKind::CancelGrace(a), Duration::from_secs(1), now);
    scheduler.set_timer(TimerKind::TaskDeadline(b), Duration::from_secs(1), now);
    scheduler.set_timer(TimerKind::ProbeCycle, Duration::from_secs(1), now);

    scheduler.cancel_task_timers(&a);

    let fired = scheduler.fired_timers(now + Duration::from_secs(1));
    assert!(fired.contains(&TimerKind::TaskDeadline(b)));
    assert!(fired.contains(&TimerKind::ProbeCycle));
    assert_eq!(fired.len(), 2);
}

#[test]
fn next_deadline_is_earliest() {
    let mut scheduler = Scheduler::new();
    let now = Instant::now();

    assert!(scheduler.next_deadline().is_none());
    scheduler.set_timer(TimerKind::ProbeCycle, Duration::from_secs(10), now);
    scheduler.set_timer(TimerKind::BudgetReset, Duration::from_secs(3), now);

    assert_eq!(scheduler.next_deadline(), Some(now + Duration::from_secs(3)));
    assert!(scheduler.has_timers());
}
