//! Backend registry with probing and priority ordering
//!
//! Lifecycle: `load` builds entries from config (unconfigured or not yet
//! probed), `probe` promotes or demotes them, `reload` rebuilds and
//! re-probes. Callers get `Arc` handles, so a reload never disturbs a
//! generation that is already running.

use crate::backend::{Capabilities, GenerationBackend, SourceKind};
use crate::config::KilnConfig;
use crate::providers::create_backend;
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinSet;

const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 15;

/// Where a backend sits in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum BackendState {
    /// Disabled, unknown, or missing credentials
    Unconfigured(String),
    /// Configured but the last probe failed (or none has run yet)
    Unavailable(String),
    Available,
}

/// Diagnostic snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendEntry {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub state: BackendState,
    pub capabilities: Option<Capabilities>,
}

struct Slot {
    entry: BackendEntry,
    backend: Option<Arc<dyn GenerationBackend>>,
    /// Registered programmatically; survives `reload`
    injected: bool,
}

/// Owns the backend registry and exposes the fallback chain
pub struct BackendSelector {
    slots: RwLock<Vec<Slot>>,
    probe_timeout: Duration,
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendSelector {
    /// An empty registry; populate with `register` or `reload`
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }

    /// Build entries for every backend the config knows about. Nothing is
    /// available until `probe` runs.
    pub fn load(config: &KilnConfig) -> Self {
        let selector = Self::new();
        *selector.write() = build_slots(config);
        selector
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Inject a backend instance, replacing any entry with the same name
    pub fn register(&self, backend: Arc<dyn GenerationBackend>, priority: i32) {
        let name = backend.name().to_string();
        let slot = Slot {
            entry: BackendEntry {
                name: name.clone(),
                priority,
                enabled: true,
                state: BackendState::Unavailable("not probed".to_string()),
                capabilities: Some(backend.capabilities()),
            },
            backend: Some(backend),
            injected: true,
        };

        let mut slots = self.write();
        slots.retain(|s| s.entry.name != name);
        slots.push(slot);
    }

    /// Probe every enabled backend concurrently. Never fails: a failed or
    /// timed-out probe marks that backend unavailable and moves on.
    pub async fn probe(&self) {
        let targets: Vec<(String, Arc<dyn GenerationBackend>)> = self
            .read()
            .iter()
            .filter(|s| s.entry.enabled)
            .filter_map(|s| s.backend.as_ref().map(|b| (s.entry.name.clone(), Arc::clone(b))))
            .collect();

        let timeout = self.probe_timeout;
        let mut set = JoinSet::new();
        for (name, backend) in targets {
            set.spawn(async move {
                let state = match tokio::time::timeout(timeout, backend.probe()).await {
                    Ok(true) => BackendState::Available,
                    Ok(false) => BackendState::Unavailable("probe failed".to_string()),
                    Err(_) => BackendState::Unavailable(format!(
                        "probe timed out after {}s",
                        timeout.as_secs_f64()
                    )),
                };
                (name, backend, state)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::warn!(error = %e, "Probe task panicked"),
            }
        }

        let mut slots = self.write();
        for (name, backend, state) in results {
            // A reload may have swapped the instance while probing
            let Some(slot) = slots.iter_mut().find(|s| {
                s.backend
                    .as_ref()
                    .is_some_and(|b| Arc::ptr_eq(b, &backend))
            }) else {
                continue;
            };

            match &state {
                BackendState::Available => {
                    tracing::info!(backend = %name, priority = slot.entry.priority, "Backend available");
                }
                BackendState::Unavailable(reason) | BackendState::Unconfigured(reason) => {
                    tracing::warn!(backend = %name, reason = %reason, "Backend unavailable");
                }
            }
            slot.entry.state = state;
        }
    }

    /// Rebuild from config and re-probe; injected backends are kept
    pub async fn reload(&self, config: &KilnConfig) {
        {
            let mut slots = self.write();
            let injected: Vec<Slot> = slots.drain(..).filter(|s| s.injected).collect();
            let mut fresh = build_slots(config);
            fresh.retain(|s| !injected.iter().any(|i| i.entry.name == s.entry.name));
            fresh.extend(injected);
            *slots = fresh;
        }
        self.probe().await;
    }

    /// Highest-priority available backend
    pub fn get_optimal(&self) -> Option<Arc<dyn GenerationBackend>> {
        self.get_ordered().into_iter().next()
    }

    /// All available backends, priority descending (name breaks ties)
    pub fn get_ordered(&self) -> Vec<Arc<dyn GenerationBackend>> {
        self.chain(|_| true)
    }

    /// The fallback chain restricted to backends that accept `source`
    pub fn ordered_for(&self, source: SourceKind) -> Vec<Arc<dyn GenerationBackend>> {
        self.chain(|entry| {
            entry
                .capabilities
                .as_ref()
                .is_some_and(|c| c.supports(source))
        })
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.read()
            .iter()
            .any(|s| s.entry.name == name && s.entry.state == BackendState::Available)
    }

    /// Snapshot of every entry in chain order
    pub fn info(&self) -> Vec<BackendEntry> {
        let mut entries: Vec<BackendEntry> = self.read().iter().map(|s| s.entry.clone()).collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        entries
    }

    fn chain(&self, filter: impl Fn(&BackendEntry) -> bool) -> Vec<Arc<dyn GenerationBackend>> {
        let slots = self.read();
        let mut available: Vec<&Slot> = slots
            .iter()
            .filter(|s| s.entry.enabled && s.entry.state == BackendState::Available)
            .filter(|s| filter(&s.entry))
            .collect();
        available.sort_by(|a, b| {
            b.entry
                .priority
                .cmp(&a.entry.priority)
                .then_with(|| a.entry.name.cmp(&b.entry.name))
        });
        available
            .into_iter()
            .filter_map(|s| s.backend.clone())
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Slot>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Slot>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn build_slots(config: &KilnConfig) -> Vec<Slot> {
    config
        .backend_names()
        .into_iter()
        .map(|name| {
            let priority = config.priority(&name);
            let enabled = config.is_enabled(&name);

            if !enabled {
                tracing::debug!(backend = %name, "Backend disabled by configuration");
                return Slot {
                    entry: BackendEntry {
                        name,
                        priority,
                        enabled,
                        state: BackendState::Unconfigured("disabled by configuration".to_string()),
                        capabilities: None,
                    },
                    backend: None,
                    injected: false,
                };
            }

            match create_backend(&name, config) {
                Ok(backend) => Slot {
                    entry: BackendEntry {
                        name,
                        priority,
                        enabled,
                        state: BackendState::Unavailable("not probed".to_string()),
                        capabilities: Some(backend.capabilities()),
                    },
                    backend: Some(backend),
                    injected: false,
                },
                Err(e) => {
                    tracing::warn!(backend = %name, error = %e, "Backend not configured");
                    Slot {
                        entry: BackendEntry {
                            name,
                            priority,
                            enabled,
                            state: BackendState::Unconfigured(e.to_string()),
                            capabilities: None,
                        },
                        backend: None,
                        injected: false,
                    }
                }
            }
        })
        .collect()
}
