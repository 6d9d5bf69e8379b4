// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Closed registry of provider factories keyed by stable string keys.
//!
//! New backends are registered at build time; there is no runtime plugin
//! loading. Factories run once, on first lookup, and the built provider is
//! cached for the life of the registry.

use crate::RuntimeProvider;
use fm_core::RuntimeKind;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type Factory = Box<dyn Fn() -> Arc<dyn RuntimeProvider> + Send + Sync>;

/// Provider factory table plus built-provider cache.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, Factory>,
    built: Mutex<HashMap<String, Arc<dyn RuntimeProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a stable string key. Re-registering a key
    /// replaces the factory and drops any cached instance.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn RuntimeProvider> + Send + Sync + 'static,
    {
        let key = key.into();
        self.built.lock().remove(&key);
        self.factories.insert(key, Box::new(factory));
    }

    /// Look up (building if needed) the provider registered under a key.
    pub fn get_by_key(&self, key: &str) -> Option<Arc<dyn RuntimeProvider>> {
        if let Some(provider) = self.built.lock().get(key) {
            return Some(Arc::clone(provider));
        }
        let factory = self.factories.get(key)?;
        let provider = factory();
        self.built.lock().insert(key.to_string(), Arc::clone(&provider));
        Some(provider)
    }

    /// Look up the provider for a runtime kind via its stable key.
    pub fn get(&self, kind: RuntimeKind) -> Option<Arc<dyn RuntimeProvider>> {
        self.get_by_key(kind.key())
    }

    /// Registered keys, sorted for deterministic iteration.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
