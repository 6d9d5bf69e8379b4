// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance registry: membership, capability index, load bookkeeping.
//!
//! The registry is the exclusive writer of Instance records. Durable
//! transitions (register, drain, removal) go through the auditor;
//! heartbeat-frequency load updates mutate state directly.

use crate::audit::Auditor;
use crate::error::EngineError;
use fm_core::{
    AuditEntry, Clock, EntityKind, Event, Instance, InstanceConfig, InstanceId, LoadSnapshot,
};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use tracing::info;

/// Registry over the shared state store plus a derived capability index.
pub struct InstanceRegistry {
    auditor: Auditor,
    /// capability → instance ids advertising it
    index: RwLock<HashMap<String, BTreeSet<InstanceId>>>,
}

impl InstanceRegistry {
    pub fn new(auditor: Auditor) -> Self {
        let registry = Self { auditor, index: RwLock::new(HashMap::new()) };
        registry.rebuild_index();
        registry
    }

    /// Rebuild the capability index from state (startup / recovery).
    pub fn rebuild_index(&self) {
        let mut index: HashMap<String, BTreeSet<InstanceId>> = HashMap::new();
        self.auditor.with_state(|state| {
            for instance in state.instances.values() {
                for capability in &instance.capabilities {
                    index.entry(capability.clone()).or_default().insert(instance.id);
                }
            }
        });
        *self.index.write() = index;
    }

    /// Register an instance. Idempotent by id; re-registration with a
    /// conflicting endpoint or runtime kind set is rejected.
    pub fn register(
        &self,
        config: InstanceConfig,
        clock: &impl Clock,
    ) -> Result<Instance, EngineError> {
        let existing = self.auditor.with_state(|state| state.get_instance(&config.id).cloned());

        if let Some(existing) = existing {
            if existing.endpoint != config.endpoint {
                return Err(EngineError::RegistrationConflict {
                    id: config.id.to_string(),
                    detail: format!(
                        "endpoint mismatch: registered {}, got {}",
                        existing.endpoint, config.endpoint
                    ),
                });
            }
            let mut declared = existing.runtime_kinds.clone();
            let mut offered = config.runtime_kinds.clone();
            declared.sort();
            offered.sort();
            if declared != offered {
                return Err(EngineError::RegistrationConflict {
                    id: config.id.to_string(),
                    detail: "runtime kind set mismatch".into(),
                });
            }
            return Ok(existing);
        }

        let instance = Instance::from_config(config, clock.epoch_ms());
        let entry = AuditEntry::new(
            clock.epoch_ms(),
            EntityKind::Instance,
            instance.id.as_str(),
            "absent",
            "registered",
            "registry",
            None,
            serde_json::to_value(&instance).map_err(fm_storage::AuditError::from)?,
        );
        self.auditor.record(
            entry,
            vec![Event::InstanceRegistered {
                id: instance.id,
                endpoint: instance.endpoint.clone(),
                region: instance.region.clone(),
                runtime_kinds: instance.runtime_kinds.clone(),
            }],
        )?;

        {
            let mut index = self.index.write();
            for capability in &instance.capabilities {
                index.entry(capability.clone()).or_default().insert(instance.id);
            }
        }

        info!(instance = %instance.id, endpoint = %instance.endpoint, "instance registered");
        Ok(instance)
    }

    /// Record a heartbeat: load snapshot plus optional capability delta.
    ///
    /// Load is volatile and bypasses the audit stream; a capability change
    /// is durable and audited.
    pub fn heartbeat(
        &self,
        id: &InstanceId,
        load: LoadSnapshot,
        capabilities: Option<BTreeSet<String>>,
        clock: &impl Clock,
    ) -> Result<(), EngineError> {
        let known = self.auditor.with_state_mut(|state| {
            match state.instances.get_mut(id.as_str()) {
                Some(instance) => {
                    instance.load = load;
                    instance.load.last_updated_ms = clock.epoch_ms();
                    true
                }
                None => false,
            }
        });
        if !known {
            return Err(EngineError::InstanceNotFound(id.to_string()));
        }

        self.auditor.publish(Event::InstanceHeartbeat { id: *id, load });

        if let Some(capabilities) = capabilities {
            let changed = self
                .auditor
                .with_state(|state| {
                    state.get_instance(id).map(|i| i.capabilities != capabilities)
                })
                .unwrap_or(false);
            if changed {
                let updated = self.auditor.with_state_mut(|state| {
                    state.instances.get_mut(id.as_str()).map(|instance| {
                        instance.capabilities = capabilities;
                        instance.clone()
                    })
                });
                if let Some(instance) = updated {
                    let entry = AuditEntry::new(
                        clock.epoch_ms(),
                        EntityKind::Instance,
                        id.as_str(),
                        "registered",
                        "capabilities_changed",
                        "registry",
                        None,
                        serde_json::to_value(&instance).map_err(fm_storage::AuditError::from)?,
                    );
                    self.auditor.record(entry, vec![])?;
                    self.rebuild_index();
                }
            }
        }

        Ok(())
    }

    /// Mark an instance draining; no new work routes to it past this point.
    pub fn begin_drain(
        &self,
        id: &InstanceId,
        deadline_ms: u64,
        clock: &impl Clock,
    ) -> Result<(), EngineError> {
        let updated = self.auditor.with_state_mut(|state| {
            state.instances.get_mut(id.as_str()).map(|instance| {
                instance.drain_deadline_ms = Some(deadline_ms);
                instance.clone()
            })
        });
        let Some(instance) = updated else {
            return Err(EngineError::InstanceNotFound(id.to_string()));
        };

        let entry = AuditEntry::new(
            clock.epoch_ms(),
            EntityKind::Instance,
            id.as_str(),
            instance.health.status.to_string(),
            "draining",
            "registry",
            None,
            serde_json::to_value(&instance).map_err(fm_storage::AuditError::from)?,
        );
        self.auditor
            .record(entry, vec![Event::InstanceDraining { id: *id, deadline_ms }])?;
        info!(instance = %id, deadline_ms, "instance draining");
        Ok(())
    }

    /// Remove an instance from membership entirely.
    pub fn remove(
        &self,
        id: &InstanceId,
        reason: &str,
        clock: &impl Clock,
    ) -> Result<(), EngineError> {
        let existing = self.auditor.with_state(|state| state.get_instance(id).cloned());
        let Some(existing) = existing else {
            return Ok(());
        };

        let entry = AuditEntry::new(
            clock.epoch_ms(),
            EntityKind::Instance,
            id.as_str(),
            existing.health.status.to_string(),
            "removed",
            "registry",
            Some(reason.to_string()),
            serde_json::Value::Null,
        );
        self.auditor.record(
            entry,
            vec![Event::InstanceRemoved { id: *id, reason: reason.to_string() }],
        )?;

        {
            let mut index = self.index.write();
            for ids in index.values_mut() {
                ids.remove(id);
            }
        }

        info!(instance = %id, reason, "instance removed");
        Ok(())
    }

    /// Instances advertising every capability in `required`.
    ///
    /// With the inverted index this is O(|capabilities| + |candidates|).
    pub fn with_capabilities(&self, required: &[String]) -> Vec<InstanceId> {
        if required.is_empty() {
            return self.auditor.with_state(|state| {
                let mut ids: Vec<InstanceId> =
                    state.instances.values().map(|i| i.id).collect();
                ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                ids
            });
        }

        let index = self.index.read();
        let mut sets = required.iter().map(|cap| index.get(cap));
        let Some(Some(first)) = sets.next() else {
            return Vec::new();
        };
        let mut candidates: BTreeSet<InstanceId> = first.clone();
        for set in sets {
            match set {
                Some(set) => candidates.retain(|id| set.contains(id)),
                None => return Vec::new(),
            }
        }
        candidates.into_iter().collect()
    }

    /// Dispatchable instances advertising every required capability,
    /// optionally restricted to a region.
    pub fn healthy_instances(
        &self,
        capabilities: &[String],
        region: Option<&str>,
    ) -> Vec<Instance> {
        let ids = self.with_capabilities(capabilities);
        self.auditor.with_state(|state| {
            ids.iter()
                .filter_map(|id| state.get_instance(id))
                .filter(|instance| instance.accepts_dispatch())
                .filter(|instance| region.map(|r| instance.region == r).unwrap_or(true))
                .cloned()
                .collect()
        })
    }

    /// Clone of the full membership, for routing and status.
    pub fn snapshot(&self) -> Vec<Instance> {
        self.auditor.with_state(|state| {
            let mut instances: Vec<Instance> = state.instances.values().cloned().collect();
            instances.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
            instances
        })
    }

    /// Look up one instance.
    pub fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.auditor.with_state(|state| state.get_instance(id).cloned())
    }

    /// Distinct instances currently running a tenant's tasks (quota spread).
    pub fn occupied_instances(&self, tenant: &str) -> Vec<InstanceId> {
        self.auditor
            .with_state(|state| state.occupied_instances(tenant))
            .into_iter()
            .map(InstanceId::from_string)
            .collect()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
