// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live host instance tracking.
//!
//! The registry holds every generation that has been constructed and not yet
//! handed off for disposal. At most one of them is "current", meaning it is
//! the one accepting new invocations. The others are orphans that are
//! finishing in-flight work.
//!
//! The lock only guards membership. Starting and stopping instances happens
//! outside of it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::signal::RestartSignal;
use super::traits::HostInstance;

/// Lifecycle of a single generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycle {
    /// Constructed, start not yet completed.
    Created,
    /// Started and current.
    Running,
    /// Superseded; draining in-flight work.
    Orphaned,
    /// Stopped and disposed.
    Disposed,
}

/// One generation of the host and its bookkeeping.
pub struct HostGeneration {
    id: String,
    generation: u64,
    is_primary: bool,
    created_at: DateTime<Utc>,
    instance: Arc<dyn HostInstance>,
    restart: RestartSignal,
    lifecycle: Mutex<InstanceLifecycle>,
}

impl HostGeneration {
    /// Wrap a freshly constructed instance.
    pub fn new(
        id: impl Into<String>,
        generation: u64,
        is_primary: bool,
        instance: Arc<dyn HostInstance>,
        restart: RestartSignal,
    ) -> Self {
        Self {
            id: id.into(),
            generation,
            is_primary,
            created_at: Utc::now(),
            instance,
            restart,
            lifecycle: Mutex::new(InstanceLifecycle::Created),
        }
    }

    /// Unique id of this generation.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Generation number.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the instance was constructed as primary.
    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    /// Construction time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The wrapped instance.
    pub fn instance(&self) -> &Arc<dyn HostInstance> {
        &self.instance
    }

    /// Restart signal of this generation.
    pub fn restart_signal(&self) -> &RestartSignal {
        &self.restart
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> InstanceLifecycle {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, from: &[InstanceLifecycle], to: InstanceLifecycle) -> bool {
        let mut state = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if from.contains(&state) {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Created → Running. Returns false if the generation was already orphaned.
    pub(crate) fn mark_running(&self) -> bool {
        self.transition(&[InstanceLifecycle::Created], InstanceLifecycle::Running)
    }

    /// Stop the instance, then dispose it.
    ///
    /// Runs at most once per generation; later calls return false without
    /// touching the instance. Failures are logged and never propagated.
    pub async fn stop_and_dispose(&self) -> bool {
        if !self.transition(
            &[InstanceLifecycle::Created, InstanceLifecycle::Running],
            InstanceLifecycle::Orphaned,
        ) {
            debug!(
                generation = self.generation,
                instance_id = %self.id,
                "Host instance already stopping; skipping"
            );
            return false;
        }

        info!(
            generation = self.generation,
            instance_id = %self.id,
            "Stopping host"
        );

        if let Err(e) = self.instance.stop().await {
            warn!(
                generation = self.generation,
                instance_id = %self.id,
                error = %e,
                "Host instance failed to stop cleanly"
            );
        }

        if let Err(e) = self.instance.dispose() {
            warn!(
                generation = self.generation,
                instance_id = %self.id,
                error = %e,
                "Host instance failed to dispose"
            );
        }

        self.transition(&[InstanceLifecycle::Orphaned], InstanceLifecycle::Disposed);
        debug!(
            generation = self.generation,
            instance_id = %self.id,
            "Host instance disposed"
        );
        true
    }
}

impl std::fmt::Debug for HostGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostGeneration")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("is_primary", &self.is_primary)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    live: Vec<Arc<HostGeneration>>,
    current: Option<String>,
}

/// Set of generations that have not yet been handed off for disposal.
#[derive(Default)]
pub struct HostInstanceRegistry {
    inner: Mutex<RegistryInner>,
}

impl HostInstanceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a generation. It does not become current until [`mark_current`](Self::mark_current).
    pub fn insert(&self, generation: Arc<HostGeneration>) {
        let mut inner = self.lock();
        if !inner.live.iter().any(|g| g.id() == generation.id()) {
            inner.live.push(generation);
        }
    }

    /// Make `id` the current generation.
    ///
    /// Returns false if the generation is no longer live (for example because
    /// shutdown drained it while it was starting).
    pub fn mark_current(&self, id: &str) -> bool {
        let mut inner = self.lock();
        if inner.live.iter().any(|g| g.id() == id) {
            inner.current = Some(id.to_string());
            true
        } else {
            false
        }
    }

    /// The generation accepting new work, if any.
    pub fn current(&self) -> Option<Arc<HostGeneration>> {
        let inner = self.lock();
        let current = inner.current.as_deref()?;
        inner.live.iter().find(|g| g.id() == current).cloned()
    }

    /// Remove a generation if it is still present.
    ///
    /// The caller that gets `Some` back owns stopping and disposing it; a
    /// second caller gets `None`.
    pub fn remove(&self, id: &str) -> Option<Arc<HostGeneration>> {
        let mut inner = self.lock();
        let position = inner.live.iter().position(|g| g.id() == id)?;
        if inner.current.as_deref() == Some(id) {
            inner.current = None;
        }
        Some(inner.live.remove(position))
    }

    /// Remove `generation` and, if this call removed it, stop and dispose it.
    ///
    /// Safe to call concurrently from the restart path and shutdown: exactly
    /// one caller performs the stop/dispose cycle.
    pub async fn orphan(&self, generation: &HostGeneration) -> bool {
        if self.remove(generation.id()).is_none() {
            debug!(
                generation = generation.generation(),
                instance_id = %generation.id(),
                "Host instance no longer registered; another caller owns it"
            );
            return false;
        }
        generation.stop_and_dispose().await
    }

    /// Take every live generation and clear the registry.
    pub fn drain(&self) -> Vec<Arc<HostGeneration>> {
        let mut inner = self.lock();
        inner.current = None;
        std::mem::take(&mut inner.live)
    }

    /// Snapshot of the live generations, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<HostGeneration>> {
        self.lock().live.clone()
    }

    /// Whether `id` is still live.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().live.iter().any(|g| g.id() == id)
    }

    /// Number of live generations.
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    /// Whether no generation is live.
    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }
}
