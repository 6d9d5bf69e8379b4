// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unix-socket listener serving the wire protocol.
//!
//! One task per connection. A connection either issues request/response
//! pairs or switches into streaming mode with `SubscribeEvents`, after
//! which it only receives `Event` frames.

use crate::bus::SubscriberBus;
use crate::lifecycle::DaemonRuntime;
use fm_wire::{read_request, write_response, ProtocolError, Request, Response, StatusReport};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Serve one client connection until it closes.
pub async fn handle_connection(
    stream: UnixStream,
    runtime: Arc<DaemonRuntime>,
    bus: Arc<SubscriberBus>,
    start_time: Instant,
) {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let request = match read_request(&mut reader).await {
            Ok(request) => request,
            Err(ProtocolError::Closed) => return,
            Err(e) => {
                debug!(error = %e, "connection read failed");
                return;
            }
        };

        // Subscriptions switch the connection into streaming mode.
        if let Request::SubscribeEvents { filter } = request {
            if write_response(&mut writer, &Response::Subscribed).await.is_err() {
                return;
            }
            let (subscription, mut rx) = bus.subscribe(filter);
            while let Some(event) = rx.recv().await {
                if write_response(&mut writer, &Response::Event { event }).await.is_err() {
                    break;
                }
            }
            bus.unsubscribe(subscription);
            return;
        }

        let response = handle_request(request, &runtime, start_time);
        if let Err(e) = write_response(&mut writer, &response).await {
            warn!(error = %e, "connection write failed");
            return;
        }
    }
}

fn handle_request(
    request: Request,
    runtime: &DaemonRuntime,
    start_time: Instant,
) -> Response {
    match request {
        Request::SubmitTask { mut spec } => {
            if spec.correlation_id.is_empty() {
                spec.correlation_id = uuid::Uuid::new_v4().to_string();
            }
            match runtime.submit_task(spec) {
                Ok(id) => Response::TaskSubmitted { id },
                Err(failure) => Response::Error {
                    message: failure.to_string(),
                    failure: Some(failure),
                },
            }
        }
        Request::CancelTask { id } => match runtime.cancel_task(&id) {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error { message: e.to_string(), failure: None },
        },
        Request::GetTask { id } => Response::Task {
            task: runtime.get_task(&id).map(Box::new),
        },
        Request::RegisterInstance { config } => match runtime.register_instance(config) {
            Ok(id) => Response::InstanceRegistered { id },
            Err(e) => Response::Error { message: e.to_string(), failure: None },
        },
        Request::Heartbeat { id, load, capabilities } => {
            match runtime.heartbeat(&id, load, capabilities) {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error { message: e.to_string(), failure: None },
            }
        }
        Request::Deregister { id } => match runtime.deregister_instance(&id) {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error { message: e.to_string(), failure: None },
        },
        Request::Status => {
            let summary = runtime.status();
            Response::Status {
                report: Box::new(StatusReport {
                    uptime_ms: start_time.elapsed().as_millis() as u64,
                    instances_total: summary.instances_total,
                    instances_healthy: summary.instances_healthy,
                    instances_degraded: summary.instances_degraded,
                    instances_unhealthy: summary.instances_unhealthy,
                    utilization: summary.utilization,
                    queued_tasks: summary.queued_tasks,
                    active_tasks: summary.active_tasks,
                    telemetry: summary.telemetry,
                }),
            }
        }
        Request::ListInstances => Response::Instances { instances: runtime.instances() },
        Request::GetAudit { entity, entity_id, up_to } => {
            match runtime.audit_entries(entity, &entity_id, up_to) {
                Ok(entries) => Response::Audit { entries },
                Err(e) => Response::Error { message: e.to_string(), failure: None },
            }
        }
        Request::Rollback { entity, entity_id, target_seq } => {
            match runtime.rollback_entity(entity, &entity_id, target_seq) {
                Ok(seq) => Response::RolledBack { seq },
                Err(e) => Response::Error { message: e.to_string(), failure: None },
            }
        }
        Request::SubscribeEvents { .. } => {
            // Handled in the connection loop before dispatch.
            Response::Error { message: "subscription already active".into(), failure: None }
        }
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
