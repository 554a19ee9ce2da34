// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Primary election by lease renewal.
//!
//! The coordinator runs a single loop: tick, then sleep for the cadence the
//! tick returned. A tick either tries to acquire the lease (while idle) or
//! renews it (while held). Because the loop awaits each tick before
//! scheduling the next one, there is never more than one store call in
//! flight for a coordinator, no matter how slow the store is.
//!
//! ```text
//!            acquire ok                      renew ok
//!   ┌──────┐ ─────────────────────► ┌──────┐ ◄──────┐
//!   │ IDLE │                        │ HELD │ ───────┘
//!   └──────┘ ◄───────────────────── └──────┘
//!    poll 5s   renew lost / error    every timeout - 3s
//! ```
//!
//! Renewal failures of any kind give up primacy. Holding on through an
//! ambiguous store error could leave two primaries once the lease expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::primary::{LeaseTransition, PrimaryState, PrimaryStateWriter};
use super::traits::{AcquireOutcome, Lease, LeaseStore, LeaseStoreError, RenewOutcome};
use crate::config::LeaseOptions;

/// Drives the acquire/renew/release state machine for one host process.
pub struct LeaseCoordinator {
    store: Arc<dyn LeaseStore>,
    resource_name: String,
    owner_id: String,
    options: LeaseOptions,
    lease: Mutex<Option<Lease>>,
    primary: PrimaryStateWriter,
    shutdown: Arc<Notify>,
}

impl LeaseCoordinator {
    /// Create a new coordinator competing for `resource_name` as `owner_id`.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        resource_name: impl Into<String>,
        owner_id: impl Into<String>,
        options: LeaseOptions,
    ) -> Self {
        Self {
            store,
            resource_name: resource_name.into(),
            owner_id: owner_id.into(),
            options,
            lease: Mutex::new(None),
            primary: PrimaryStateWriter::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Reader for the primary flag.
    pub fn primary_state(&self) -> PrimaryState {
        self.primary.reader()
    }

    /// Whether this coordinator currently holds the lease.
    pub fn is_primary(&self) -> bool {
        self.primary.is_primary()
    }

    /// Identity used when acquiring.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Name of the leased resource.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Snapshot of the held lease, if any.
    pub async fn lease(&self) -> Option<Lease> {
        self.lease.lock().await.clone()
    }

    /// Cadence for the current state.
    pub async fn current_interval(&self) -> Duration {
        self.interval_for(self.lease.lock().await.is_some())
    }

    fn interval_for(&self, held: bool) -> Duration {
        if held {
            self.options.renewal_interval()
        } else {
            self.options.acquire_interval()
        }
    }

    /// Spawn the coordinator loop onto the runtime.
    pub fn start(self) -> LeaseCoordinatorHandle {
        let coordinator = Arc::new(self);
        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };
        LeaseCoordinatorHandle { coordinator, task }
    }

    /// Run the coordinator loop until the shutdown signal is received.
    ///
    /// The first tick happens immediately. On exit the lease is released if
    /// it is still held.
    pub async fn run(&self) {
        info!(
            resource = %self.resource_name,
            owner_id = %self.owner_id,
            store = self.store.store_type(),
            lease_timeout_ms = self.options.timeout().as_millis() as u64,
            renewal_interval_ms = self.options.renewal_interval().as_millis() as u64,
            acquire_interval_ms = self.options.acquire_interval().as_millis() as u64,
            "Lease coordinator started"
        );

        loop {
            let next = self.tick().await;

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(resource = %self.resource_name, "Lease coordinator received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(next) => {}
            }
        }

        self.release().await;

        info!(resource = %self.resource_name, "Lease coordinator stopped");
    }

    /// Perform one acquire-or-renew step and return the delay until the next one.
    ///
    /// Ticks are serialized; a concurrent caller waits for the running tick.
    pub async fn tick(&self) -> Duration {
        let mut slot = self.lease.lock().await;

        *slot = match slot.take() {
            None => self.acquire().await,
            Some(held) => self.renew(held).await,
        };

        self.interval_for(slot.is_some())
    }

    /// Give up the lease if held. Failures are logged and swallowed.
    pub async fn release(&self) {
        let mut slot = self.lease.lock().await;
        let Some(held) = slot.take() else {
            return;
        };

        match self.store.release(&held.handle).await {
            Ok(()) => info!(
                resource = %self.resource_name,
                owner_id = %self.owner_id,
                "Host lock lease released"
            ),
            Err(e) => warn!(
                resource = %self.resource_name,
                owner_id = %self.owner_id,
                error = %e,
                "Failed to release host lock lease; it will expire on its own"
            ),
        }

        self.primary.publish(LeaseTransition::Released {
            owner_id: self.owner_id.clone(),
            at: Utc::now(),
        });
    }

    async fn acquire(&self) -> Option<Lease> {
        let proposed_token = Uuid::new_v4().to_string();

        let outcome = match self.try_acquire_once(&proposed_token).await {
            (Err(LeaseStoreError::ResourceMissing(_)), _) => {
                info!(
                    resource = %self.resource_name,
                    "Lease resource does not exist; creating it"
                );
                if let Err(e) = self
                    .store
                    .create_resource_if_missing(&self.resource_name)
                    .await
                {
                    warn!(
                        resource = %self.resource_name,
                        error = %e,
                        "Failed to create lease resource; retrying on next tick"
                    );
                    return None;
                }
                self.try_acquire_once(&proposed_token).await
            }
            other => other,
        };

        match outcome {
            (Ok(AcquireOutcome::Acquired(handle)), latency) => {
                let now = Utc::now();
                info!(
                    resource = %self.resource_name,
                    owner_id = %self.owner_id,
                    latency_ms = latency.as_millis() as u64,
                    "Host lock lease acquired by instance ID '{}'.",
                    self.owner_id
                );

                self.primary.publish(LeaseTransition::Acquired {
                    owner_id: self.owner_id.clone(),
                    at: now,
                });

                Some(Lease {
                    handle,
                    owner_id: self.owner_id.clone(),
                    timeout: self.options.timeout(),
                    acquired_at: now,
                    last_renewal: now,
                    last_renewal_latency: latency,
                })
            }
            (Ok(AcquireOutcome::Contended), _) => {
                debug!(
                    resource = %self.resource_name,
                    owner_id = %self.owner_id,
                    "Host lock lease held by another instance"
                );
                None
            }
            (Err(e), _) => {
                warn!(
                    resource = %self.resource_name,
                    owner_id = %self.owner_id,
                    error = %e,
                    "Server error acquiring host lock lease; retrying on next tick"
                );
                None
            }
        }
    }

    async fn try_acquire_once(
        &self,
        proposed_token: &str,
    ) -> (Result<AcquireOutcome, LeaseStoreError>, Duration) {
        let started = Instant::now();
        let result = self
            .store
            .try_acquire(
                &self.resource_name,
                &self.owner_id,
                proposed_token,
                self.options.timeout(),
            )
            .await;
        (result, started.elapsed())
    }

    async fn renew(&self, mut held: Lease) -> Option<Lease> {
        let started = Instant::now();

        match self.store.renew(&held.handle, self.options.timeout()).await {
            Ok(RenewOutcome::Renewed) => {
                held.last_renewal = Utc::now();
                held.last_renewal_latency = started.elapsed();
                debug!(
                    resource = %self.resource_name,
                    latency_ms = held.last_renewal_latency.as_millis() as u64,
                    "Host lock lease renewed"
                );
                Some(held)
            }
            Ok(RenewOutcome::Lost) => {
                self.lease_lost(&held, "Another host has acquired the lease", false);
                None
            }
            Err(e) => {
                self.lease_lost(&held, &e.to_string(), true);
                None
            }
        }
    }

    fn lease_lost(&self, held: &Lease, reason: &str, store_error: bool) {
        let since_ms = held.since_last_renewal().as_millis() as u64;
        let latency_ms = held.last_renewal_latency.as_millis() as u64;
        let period_ms = held.timeout.as_millis() as u64;
        let last_renewal = held.last_renewal.format("%Y-%m-%dT%H:%M:%S%.3fZ");

        if store_error {
            warn!(
                resource = %self.resource_name,
                owner_id = %self.owner_id,
                since_last_renewal_ms = since_ms,
                last_renewal_latency_ms = latency_ms,
                lease_period_ms = period_ms,
                "Failed to renew host lock lease: {}. The last successful renewal completed at {} ({} milliseconds ago) with a duration of {} milliseconds. The lease period was {} milliseconds.",
                reason, last_renewal, since_ms, latency_ms, period_ms
            );
        } else {
            info!(
                resource = %self.resource_name,
                owner_id = %self.owner_id,
                since_last_renewal_ms = since_ms,
                last_renewal_latency_ms = latency_ms,
                lease_period_ms = period_ms,
                "Failed to renew host lock lease: {}. The last successful renewal completed at {} ({} milliseconds ago) with a duration of {} milliseconds. The lease period was {} milliseconds.",
                reason, last_renewal, since_ms, latency_ms, period_ms
            );
        }

        self.primary.publish(LeaseTransition::Lost {
            owner_id: self.owner_id.clone(),
            at: Utc::now(),
        });
    }
}

/// A running lease coordinator.
pub struct LeaseCoordinatorHandle {
    coordinator: Arc<LeaseCoordinator>,
    task: JoinHandle<()>,
}

impl LeaseCoordinatorHandle {
    /// Reader for the primary flag.
    pub fn primary_state(&self) -> PrimaryState {
        self.coordinator.primary_state()
    }

    /// Whether this host currently holds the lease.
    pub fn is_primary(&self) -> bool {
        self.coordinator.is_primary()
    }

    /// The coordinator driven by this handle.
    pub fn coordinator(&self) -> &Arc<LeaseCoordinator> {
        &self.coordinator
    }

    /// Check if the loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and release the lease if held. Never fails.
    pub async fn stop(self) {
        self.coordinator.shutdown.notify_one();
        if let Err(e) = self.task.await {
            error!("Lease coordinator task panicked: {}", e);
        }
    }
}
