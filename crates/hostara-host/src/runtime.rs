// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for hostara-host.
//!
//! [`HostRuntime`] wires a [`LeaseCoordinator`] to a [`HostLifecycleManager`]
//! so the host can be embedded in an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hostara_host::host::StandbyHostFactory;
//! use hostara_host::lease::PostgresLeaseStore;
//! use hostara_host::runtime::HostRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = HostRuntime::builder()
//!         .lease_store(Arc::new(PostgresLeaseStore::new(pool)))
//!         .host_factory(Arc::new(StandbyHostFactory::new("my-app")))
//!         .host_id("my-app")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Without a lease store the runtime runs a single host with no primary
//! election; every generation is constructed as non-primary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{LeaseOptions, LifecycleOptions};
use crate::host::{HostInstanceFactory, HostLifecycleManager, HostState, RestartReason};
use crate::lease::{LeaseCoordinator, LeaseCoordinatorHandle, LeaseStore, PrimaryState};

/// Builder for creating a [`HostRuntime`].
pub struct HostRuntimeBuilder {
    lease_store: Option<Arc<dyn LeaseStore>>,
    host_factory: Option<Arc<dyn HostInstanceFactory>>,
    host_id: Option<String>,
    instance_id: Option<String>,
    lease_options: LeaseOptions,
    lifecycle_options: LifecycleOptions,
    restart_on_lease_change: bool,
    shutdown_timeout: Duration,
}

impl Default for HostRuntimeBuilder {
    fn default() -> Self {
        Self {
            lease_store: None,
            host_factory: None,
            host_id: None,
            instance_id: None,
            lease_options: LeaseOptions::default(),
            lifecycle_options: LifecycleOptions::default(),
            restart_on_lease_change: true,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl HostRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease store used for primary election.
    ///
    /// When unset, no election runs and the host is never primary.
    pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    /// Set the factory that builds host generations (required).
    pub fn host_factory(mut self, factory: Arc<dyn HostInstanceFactory>) -> Self {
        self.host_factory = Some(factory);
        self
    }

    /// Set the host id. It names the leased resource, so every process of
    /// the same application must use the same value.
    ///
    /// Required when a lease store is set.
    pub fn host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    /// Set this process's identity in the lease.
    ///
    /// Default: a random UUID
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Set lease timing.
    ///
    /// Default: 15 second lease, renewed every 12 seconds
    pub fn lease_options(mut self, options: LeaseOptions) -> Self {
        self.lease_options = options;
        self
    }

    /// Set restart backoff and shutdown behavior of the lifecycle manager.
    pub fn lifecycle_options(mut self, options: LifecycleOptions) -> Self {
        self.lifecycle_options = options;
        self
    }

    /// Restart the current host whenever this process gains or loses primacy.
    ///
    /// Default: true
    pub fn restart_on_lease_change(mut self, enabled: bool) -> Self {
        self.restart_on_lease_change = enabled;
        self
    }

    /// Upper bound on stopping the host generations during shutdown.
    ///
    /// Default: 30 seconds
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<HostRuntimeConfig> {
        let host_factory = self
            .host_factory
            .ok_or_else(|| anyhow::anyhow!("host_factory is required"))?;

        if self.lease_store.is_some() && self.host_id.is_none() {
            anyhow::bail!("host_id is required when a lease store is set");
        }
        if let Some(host_id) = &self.host_id
            && host_id.trim().is_empty()
        {
            anyhow::bail!("host_id must not be empty");
        }

        Ok(HostRuntimeConfig {
            lease_store: self.lease_store,
            host_factory,
            host_id: self.host_id.unwrap_or_else(|| "hostara".to_string()),
            instance_id: self
                .instance_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            lease_options: self.lease_options,
            lifecycle_options: self.lifecycle_options,
            restart_on_lease_change: self.restart_on_lease_change,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// Configuration for a [`HostRuntime`].
pub struct HostRuntimeConfig {
    lease_store: Option<Arc<dyn LeaseStore>>,
    host_factory: Arc<dyn HostInstanceFactory>,
    host_id: String,
    instance_id: String,
    lease_options: LeaseOptions,
    lifecycle_options: LifecycleOptions,
    restart_on_lease_change: bool,
    shutdown_timeout: Duration,
}

impl HostRuntimeConfig {
    /// Host id (lease resource name).
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Identity of this process in the lease.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Start the runtime, spawning the lease coordinator and the host loop.
    pub async fn start(self) -> Result<HostRuntime> {
        info!(
            host_id = %self.host_id,
            instance_id = %self.instance_id,
            election = self.lease_store.is_some(),
            "Starting HostRuntime"
        );

        let coordinator = self.lease_store.clone().map(|store| {
            LeaseCoordinator::new(
                store,
                self.host_id.clone(),
                self.instance_id.clone(),
                self.lease_options,
            )
        });
        let primary = coordinator.as_ref().map(|c| c.primary_state());

        // Subscribe before the first tick so no flip goes unnoticed.
        let lease_rx = primary
            .as_ref()
            .filter(|_| self.restart_on_lease_change)
            .map(|p| p.subscribe());

        let mut manager = HostLifecycleManager::new(self.host_factory, self.lifecycle_options);
        if let Some(primary) = primary {
            manager = manager.with_primary_state(primary);
        }
        let manager = Arc::new(manager);
        let manager_handle = manager.spawn();

        let lease_watch_shutdown = Arc::new(Notify::new());
        let lease_watch_handle = lease_rx
            .map(|rx| spawn_lease_watch(rx, manager.clone(), lease_watch_shutdown.clone()));

        let coordinator = coordinator.map(LeaseCoordinator::start);

        info!(host_id = %self.host_id, "HostRuntime started");

        Ok(HostRuntime {
            host_id: self.host_id,
            instance_id: self.instance_id,
            lease_store: self.lease_store,
            coordinator,
            manager,
            manager_handle,
            lease_watch_shutdown,
            lease_watch_handle,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// Restart the host on every primary flip so the next generation sees the
/// new role at construction.
fn spawn_lease_watch(
    mut rx: watch::Receiver<bool>,
    manager: Arc<HostLifecycleManager>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,

                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    rx.borrow_and_update();
                    manager.restart_on_role_change();
                }
            }
        }
    })
}

/// Point-in-time view of the runtime.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    /// Host id (lease resource name)
    pub host_id: String,
    /// Identity of this process in the lease
    pub instance_id: String,
    /// Host state
    pub state: HostState,
    /// Whether this process holds the primary lease
    pub is_primary: bool,
    /// Generation number of the current host, if any
    pub current_generation: Option<u64>,
    /// Generations not yet disposed, current included
    pub live_instances: usize,
    /// Generations constructed so far
    pub start_count: u64,
    /// Last start failure
    pub last_error: Option<String>,
    /// Start failures in a row
    pub consecutive_errors: u32,
}

/// A running host runtime.
///
/// Call [`shutdown`](Self::shutdown) to stop it gracefully.
pub struct HostRuntime {
    host_id: String,
    instance_id: String,
    lease_store: Option<Arc<dyn LeaseStore>>,
    coordinator: Option<LeaseCoordinatorHandle>,
    manager: Arc<HostLifecycleManager>,
    manager_handle: JoinHandle<()>,
    lease_watch_shutdown: Arc<Notify>,
    lease_watch_handle: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl HostRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> HostRuntimeBuilder {
        HostRuntimeBuilder::new()
    }

    /// Host id (lease resource name).
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Identity of this process in the lease.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Whether this process currently holds the primary lease.
    pub fn is_primary(&self) -> bool {
        self.coordinator
            .as_ref()
            .is_some_and(|coordinator| coordinator.is_primary())
    }

    /// Reader for the primary flag, when election is enabled.
    pub fn primary_state(&self) -> Option<PrimaryState> {
        self.coordinator
            .as_ref()
            .map(|coordinator| coordinator.primary_state())
    }

    /// The lifecycle manager.
    pub fn manager(&self) -> &Arc<HostLifecycleManager> {
        &self.manager
    }

    /// Current host state.
    pub fn host_state(&self) -> HostState {
        self.manager.state()
    }

    /// Whether new invocations may be routed to the host.
    pub fn can_invoke(&self) -> bool {
        self.manager.can_invoke()
    }

    /// Wait until the host is running. See [`HostLifecycleManager::wait_until_ready`].
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.manager.wait_until_ready(timeout).await
    }

    /// Ask for the current host to be replaced.
    pub fn request_restart(&self, reason: RestartReason) -> bool {
        self.manager.request_restart(reason)
    }

    /// Owner of the active lease according to the store.
    ///
    /// Returns `None` when election is disabled or the lease is available.
    pub async fn lock_owner(&self) -> crate::Result<Option<String>> {
        match &self.lease_store {
            Some(store) => Ok(store.get_owner(&self.host_id).await?),
            None => Ok(None),
        }
    }

    /// Snapshot of the runtime state.
    pub fn status(&self) -> HostStatus {
        HostStatus {
            host_id: self.host_id.clone(),
            instance_id: self.instance_id.clone(),
            state: self.manager.state(),
            is_primary: self.is_primary(),
            current_generation: self
                .manager
                .current_instance()
                .map(|current| current.generation()),
            live_instances: self.manager.registry().len(),
            start_count: self.manager.start_count(),
            last_error: self.manager.last_error(),
            consecutive_errors: self.manager.consecutive_errors(),
        }
    }

    /// Check if the host loop is still running.
    pub fn is_running(&self) -> bool {
        !self.manager_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops every host generation, then stops the lease coordinator, which
    /// releases the lease if held. Waiting on the hosts is bounded by
    /// `shutdown_timeout`; generations still stopping after that finish in
    /// the background, and the coordinator is stopped regardless.
    pub async fn shutdown(self) -> Result<()> {
        info!("HostRuntime shutting down...");

        // Signal lease watch shutdown
        self.lease_watch_shutdown.notify_one();
        if let Some(handle) = self.lease_watch_handle
            && let Err(e) = handle.await
        {
            error!("Lease watch task panicked: {}", e);
        }

        let deadline = Instant::now() + self.shutdown_timeout;

        // Stop all host generations
        if tokio::time::timeout_at(deadline, self.manager.shutdown())
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Timed out stopping host instances; they keep draining in the background"
            );
        }

        // Wait for host loop
        let mut manager_handle = self.manager_handle;
        let manager_result = match tokio::time::timeout_at(deadline, &mut manager_handle).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Host lifecycle loop did not exit in time; aborting it");
                manager_handle.abort();
                Ok(())
            }
        };

        // Stop election last so the lease is held until hosts are gone
        if let Some(coordinator) = self.coordinator {
            coordinator.stop().await;
        }

        match manager_result {
            Ok(()) => {
                info!("HostRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Host lifecycle task panicked: {}", e);
                Err(anyhow::anyhow!("host lifecycle task panicked: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHostFactory;
    use crate::lease::MemoryLeaseStore;

    #[test]
    fn test_builder_requires_host_factory() {
        let result = HostRuntime::builder().build();
        assert!(result.is_err());
        assert!(
            result
                .err()
                .unwrap()
                .to_string()
                .contains("host_factory is required")
        );
    }

    #[test]
    fn test_builder_requires_host_id_with_lease_store() {
        let result = HostRuntime::builder()
            .host_factory(Arc::new(MockHostFactory::new()))
            .lease_store(Arc::new(MemoryLeaseStore::new()))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_empty_host_id() {
        let result = HostRuntime::builder()
            .host_factory(Arc::new(MockHostFactory::new()))
            .host_id("  ")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let config = HostRuntime::builder()
            .host_factory(Arc::new(MockHostFactory::new()))
            .build()
            .unwrap();

        assert_eq!(config.host_id(), "hostara");
        assert!(Uuid::parse_str(config.instance_id()).is_ok());
        assert!(config.restart_on_lease_change);
        assert_eq!(config.lease_options.timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_builder_custom_values() {
        let config = HostRuntime::builder()
            .host_factory(Arc::new(MockHostFactory::new()))
            .lease_store(Arc::new(MemoryLeaseStore::new()))
            .host_id("app")
            .instance_id("node-1")
            .restart_on_lease_change(false)
            .shutdown_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(config.host_id(), "app");
        assert_eq!(config.instance_id(), "node-1");
        assert!(!config.restart_on_lease_change);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_runtime_without_election_is_never_primary() {
        let runtime = HostRuntime::builder()
            .host_factory(Arc::new(MockHostFactory::new()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.wait_until_ready(Duration::from_secs(5)).await);
        assert!(!runtime.is_primary());
        assert!(runtime.primary_state().is_none());
        assert_eq!(runtime.lock_owner().await.unwrap(), None);

        runtime.shutdown().await.unwrap();
    }
}
