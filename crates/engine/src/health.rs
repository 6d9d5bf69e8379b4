// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Health monitor: periodic liveness probes and status transitions.
//!
//! Each cycle probes every registered instance with a bounded pool
//! (`min(probe_pool_max, |instances|)`), parses the capacity report, and
//! applies transitions:
//!
//! - Healthy → Degraded on slow probes or high utilization
//! - Degraded → Unhealthy after consecutive probe failures
//! - Any → Healthy after consecutive good probes
//! - Unhealthy → removed after `remove_after` of continuous unhealthiness

use crate::audit::Auditor;
use crate::config::HealthConfig;
use crate::error::EngineError;
use crate::registry::InstanceRegistry;
use async_trait::async_trait;
use fm_core::{
    AuditEntry, Clock, EntityKind, Event, HealthStatus, Instance, InstanceId, LoadSnapshot,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// What a successful probe reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub latency_ms: u64,
    /// Lightweight capacity report piggybacked on the probe
    pub load: Option<LoadSnapshot>,
}

/// Executes one liveness probe against an instance.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(&self, instance: &Instance) -> Result<ProbeReport, String>;
}

/// Probes `GET /healthz` on the instance endpoint over raw TCP.
///
/// The body, when parseable, is a JSON [`LoadSnapshot`] capacity report.
pub struct HttpProber;

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, instance: &Instance) -> Result<ProbeReport, String> {
        let started = std::time::Instant::now();
        let request = format!("GET /healthz HTTP/1.1\r\nHost: {}\r\n\r\n", instance.endpoint);

        let response = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let mut stream = tokio::net::TcpStream::connect(&instance.endpoint)
                .await
                .map_err(|e| format!("connect failed: {}", e))?;
            stream
                .write_all(request.as_bytes())
                .await
                .map_err(|e| format!("write failed: {}", e))?;
            let mut buf = Vec::with_capacity(1024);
            let mut chunk = [0u8; 1024];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.len() > 64 * 1024 {
                            break;
                        }
                    }
                    Err(e) => return Err(format!("read failed: {}", e)),
                }
            }
            Ok::<Vec<u8>, String>(buf)
        })
        .await
        .map_err(|_| "probe timed out".to_string())??;

        let text = String::from_utf8_lossy(&response);
        if !text.starts_with("HTTP/1.1 200") && !text.starts_with("HTTP/1.0 200") {
            return Err(format!(
                "unexpected probe status: {}",
                text.lines().next().unwrap_or("<empty>")
            ));
        }

        let load = text
            .split("\r\n\r\n")
            .nth(1)
            .and_then(|body| serde_json::from_str::<LoadSnapshot>(body.trim()).ok());

        Ok(ProbeReport { latency_ms: started.elapsed().as_millis() as u64, load })
    }
}

/// Scripted prober for tests.
#[cfg(any(test, feature = "test-support"))]
#[derive(Default)]
pub struct FakeProber {
    results: Mutex<HashMap<InstanceId, std::collections::VecDeque<Result<ProbeReport, String>>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a probe result for an instance; once drained, probes succeed
    /// with a fast, empty report.
    pub fn push(&self, id: InstanceId, result: Result<ProbeReport, String>) {
        self.results.lock().entry(id).or_default().push_back(result);
    }

    /// Queue the same result n times.
    pub fn push_n(&self, id: InstanceId, result: Result<ProbeReport, String>, n: usize) {
        for _ in 0..n {
            self.push(id, result.clone());
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, instance: &Instance) -> Result<ProbeReport, String> {
        self.results
            .lock()
            .get_mut(&instance.id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(ProbeReport { latency_ms: 5, load: None }))
    }
}

#[derive(Debug, Default, Clone)]
struct Track {
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_since_ms: Option<u64>,
}

/// Drives probe cycles and owns the consecutive-result bookkeeping.
pub struct HealthMonitor {
    config: HealthConfig,
    auditor: Auditor,
    prober: Arc<dyn Prober>,
    track: Mutex<HashMap<InstanceId, Track>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, auditor: Auditor, prober: Arc<dyn Prober>) -> Self {
        Self { config, auditor, prober, track: Mutex::new(HashMap::new()) }
    }

    /// Probe every instance once and apply transitions.
    ///
    /// Returns instances whose continuous unhealthiness exceeded
    /// `remove_after`; the caller removes them and fails over their tasks.
    pub async fn run_cycle(
        &self,
        registry: &InstanceRegistry,
        clock: &impl Clock,
    ) -> Result<Vec<InstanceId>, EngineError> {
        let instances = registry.snapshot();
        if instances.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.config.probe_pool_max.min(instances.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(pool));

        let mut handles = Vec::with_capacity(instances.len());
        for instance in instances {
            let semaphore = Arc::clone(&semaphore);
            let prober = Arc::clone(&self.prober);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = prober.probe(&instance).await;
                (instance.id, result)
            }));
        }

        let mut to_remove = Vec::new();
        for handle in handles {
            let Ok((id, result)) = handle.await else {
                continue;
            };
            if self.apply_probe(&id, result, clock)? {
                to_remove.push(id);
            }
        }

        // Forget tracking for instances that left the registry.
        {
            let known: std::collections::HashSet<InstanceId> =
                registry.snapshot().iter().map(|i| i.id).collect();
            self.track.lock().retain(|id, _| known.contains(id));
        }

        Ok(to_remove)
    }

    /// Apply one probe result. Returns true when the instance has been
    /// unhealthy long enough to be removed.
    pub fn apply_probe(
        &self,
        id: &InstanceId,
        result: Result<ProbeReport, String>,
        clock: &impl Clock,
    ) -> Result<bool, EngineError> {
        let now_ms = clock.epoch_ms();
        let current = self.auditor.with_state(|state| state.get_instance(id).cloned());
        let Some(current) = current else {
            return Ok(false);
        };

        let (new_status, error, load) = {
            let mut track = self.track.lock();
            let track = track.entry(*id).or_default();
            match result {
                Ok(report) => {
                    track.consecutive_failures = 0;
                    track.consecutive_successes += 1;

                    let util_high = report
                        .load
                        .map(|l| l.cpu_util.max(l.mem_util) > self.config.degraded_util)
                        .unwrap_or(false);
                    let slow =
                        report.latency_ms > self.config.degraded_latency.as_millis() as u64;

                    let status = if slow || util_high {
                        HealthStatus::Degraded
                    } else if track.consecutive_successes
                        >= self.config.healthy_consecutive_successes
                    {
                        HealthStatus::Healthy
                    } else {
                        // Not yet enough evidence to promote.
                        match current.health.status {
                            HealthStatus::Healthy => HealthStatus::Healthy,
                            other => other,
                        }
                    };
                    if status != HealthStatus::Unhealthy {
                        track.unhealthy_since_ms = None;
                    }
                    (status, None, report.load)
                }
                Err(error) => {
                    track.consecutive_successes = 0;
                    track.consecutive_failures += 1;

                    let status = if track.consecutive_failures
                        >= self.config.unhealthy_consecutive_failures
                    {
                        if track.unhealthy_since_ms.is_none() {
                            track.unhealthy_since_ms = Some(now_ms);
                        }
                        HealthStatus::Unhealthy
                    } else if current.health.status == HealthStatus::Healthy {
                        HealthStatus::Degraded
                    } else {
                        current.health.status
                    };
                    (status, Some(error), None)
                }
            }
        };

        let from = current.health.status;
        if from != new_status {
            let updated = self.auditor.with_state_mut(|state| {
                state.instances.get_mut(id.as_str()).map(|instance| {
                    instance.health.status = new_status;
                    instance.health.last_probe_ms = now_ms;
                    instance.health.last_error = error.clone();
                    if let Some(load) = load {
                        instance.load = load;
                        instance.load.last_updated_ms = now_ms;
                    }
                    instance.clone()
                })
            });
            if let Some(instance) = updated {
                debug!(instance = %id, %from, to = %new_status, "health transition");
                let entry = AuditEntry::new(
                    now_ms,
                    EntityKind::Instance,
                    id.as_str(),
                    from.to_string(),
                    new_status.to_string(),
                    "health_monitor",
                    error.clone(),
                    serde_json::to_value(&instance).map_err(fm_storage::AuditError::from)?,
                );
                self.auditor.record(
                    entry,
                    vec![Event::InstanceHealthChanged {
                        id: *id,
                        from,
                        to: new_status,
                        reason: error,
                    }],
                )?;
            }
        } else {
            // No transition: probe evidence is volatile bookkeeping.
            self.auditor.with_state_mut(|state| {
                if let Some(instance) = state.instances.get_mut(id.as_str()) {
                    instance.health.last_probe_ms = now_ms;
                    instance.health.last_error = error;
                    if let Some(load) = load {
                        instance.load = load;
                        instance.load.last_updated_ms = now_ms;
                    }
                }
            });
        }

        let overdue = {
            let track = self.track.lock();
            track
                .get(id)
                .and_then(|t| t.unhealthy_since_ms)
                .map(|since| now_ms.saturating_sub(since) >= self.config.remove_after.as_millis() as u64)
                .unwrap_or(false)
        };
        if overdue {
            warn!(instance = %id, "unhealthy past remove_after, scheduling removal");
        }
        Ok(overdue)
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
