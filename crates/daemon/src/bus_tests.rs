// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use fm_core::{Priority, TaskId};

fn task_event(n: u32) -> Event {
    Event::TaskSubmitted {
        id: TaskId::from_string(format!("tsk-{n}")),
        tenant: "acme".into(),
        priority: Priority::Normal,
        correlation_id: String::new(),
    }
}

fn bus() -> SubscriberBus {
    SubscriberBus::new(Arc::new(Telemetry::new()))
}

#[tokio::test]
async fn delivery_preserves_publication_order() {
    let bus = bus();
    let (_id, mut rx) = bus.subscribe(EventFilter::all());

    for n in 0..5 {
        bus.publish(task_event(n));
    }
    for n in 0..5 {
        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id(), Some(TaskId::from_string(format!("tsk-{n}"))));
    }
}

#[tokio::test]
async fn filters_scope_delivery() {
    let bus = bus();
    let (_a, mut task_rx) = bus.subscribe(EventFilter {
        types: vec!["task:*".into()],
        ..EventFilter::all()
    });
    let (_b, mut instance_rx) = bus.subscribe(EventFilter {
        types: vec!["instance:*".into()],
        ..EventFilter::all()
    });

    bus.publish(task_event(1));

    assert!(task_rx.recv().await.is_some());
    assert!(instance_rx.try_recv().is_err());
}

#[tokio::test]
async fn full_queue_drops_for_that_subscriber_only() {
    let bus = bus();
    let (_slow, _slow_rx) = bus.subscribe(EventFilter::all());
    let (_fast, mut fast_rx) = bus.subscribe(EventFilter::all());

    // Overflow the slow subscriber's queue (capacity 256) without draining.
    for n in 0..300 {
        bus.publish(task_event(n));
    }

    // The healthy subscriber still got everything its queue could hold and
    // drains normally.
    let mut received = 0;
    while fast_rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 256);
}

#[tokio::test]
async fn dead_subscriber_queue_is_freed() {
    let telemetry = Arc::new(Telemetry::new());
    let bus = SubscriberBus::new(Arc::clone(&telemetry));

    let (_id, rx) = bus.subscribe(EventFilter::all());
    drop(rx); // Closed channel fails every delivery.
    assert_eq!(bus.subscriber_count(), 1);

    for n in 0..10 {
        bus.publish(task_event(n));
    }

    assert_eq!(bus.subscriber_count(), 0);
    assert!(telemetry.dropped_count("closed") >= 8);
}

#[tokio::test]
async fn unsubscribe_detaches() {
    let bus = bus();
    let (id, mut rx) = bus.subscribe(EventFilter::all());
    bus.unsubscribe(id);
    bus.publish(task_event(1));
    assert!(rx.recv().await.is_none());
}
