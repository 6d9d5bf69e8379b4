// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscriber event bus.
//!
//! `publish` never blocks a producer: each subscriber has its own bounded
//! queue, and a full queue drops the event for that subscriber only, with
//! a counter keyed by reason. Delivery order is per-subscriber FIFO; there
//! is no cross-subscriber ordering.
//!
//! Events flagged audit-true are already durable before they reach the bus
//! (the engine's write-ahead auditor flushes synchronously for them).
//!
//! A subscriber that fails `DEAD_AFTER_CONSECUTIVE` deliveries in a row
//! transitions to dead and its queue is freed.

use fm_core::{Event, EventFilter, EventSink, Telemetry};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-subscriber queue depth.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Consecutive failed deliveries before a subscriber is declared dead.
const DEAD_AFTER_CONSECUTIVE: u32 = 8;

/// Handle returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    tx: Option<mpsc::Sender<Event>>,
    consecutive_failures: u32,
}

/// Fan-out bus from the engine to any number of subscribers.
pub struct SubscriberBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: Mutex<u64>,
    telemetry: Arc<Telemetry>,
}

impl SubscriberBus {
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self { subscribers: Mutex::new(Vec::new()), next_id: Mutex::new(0), telemetry }
    }

    /// Register a subscriber; events matching `filter` arrive on the
    /// returned receiver in publication order.
    pub fn subscribe(&self, filter: EventFilter) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            SubscriptionId(*next)
        };
        self.subscribers.lock().push(Subscriber {
            id,
            filter,
            tx: Some(tx),
            consecutive_failures: 0,
        });
        debug!(subscription = id.0, "subscriber attached");
        (id, rx)
    }

    /// Detach a subscriber and free its queue.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    /// Live (non-dead) subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|s| s.tx.is_some()).count()
    }
}

impl EventSink for SubscriberBus {
    fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter_mut() {
            let Some(tx) = &subscriber.tx else { continue };
            if !subscriber.filter.matches(&event) {
                continue;
            }

            match tx.try_send(event.clone()) {
                Ok(()) => subscriber.consecutive_failures = 0,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.telemetry.incr_dropped("queue_full");
                    subscriber.consecutive_failures += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.telemetry.incr_dropped("closed");
                    subscriber.consecutive_failures += 1;
                }
            }

            if subscriber.consecutive_failures >= DEAD_AFTER_CONSECUTIVE {
                warn!(subscription = subscriber.id.0, "subscriber dead, freeing queue");
                subscriber.tx = None;
            }
        }
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
