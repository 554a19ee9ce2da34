// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory lease store.
//!
//! Shares lease state between coordinators in the same process. Used by tests
//! and single-process development setups. Expiry follows the tokio clock, so
//! tests running with paused time can advance past a lease timeout.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::traits::*;

#[derive(Debug, Clone)]
struct ActiveLease {
    token: String,
    owner_id: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Resource {
    lease: Option<ActiveLease>,
}

impl Resource {
    fn active(&self, now: Instant) -> Option<&ActiveLease> {
        self.lease.as_ref().filter(|l| l.expires_at > now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    resources: HashMap<String, Resource>,
    fail_acquires: usize,
    fail_renewals: usize,
    fail_releases: usize,
    latency: Duration,
}

#[derive(Debug, Default)]
struct CallCounters {
    acquire: AtomicUsize,
    renew: AtomicUsize,
    release: AtomicUsize,
    create: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a CallCounters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a CallCounters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory lease store with fault injection.
///
/// Clones share the same state, so handing one clone to each coordinator
/// simulates a fleet competing for one storage object.
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    state: Arc<Mutex<MemoryState>>,
    counters: Arc<CallCounters>,
}

impl MemoryLeaseStore {
    /// Create an empty store. Resources must be created before they can be leased.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with `resource_name` already present.
    pub async fn with_resource(resource_name: &str) -> Self {
        let store = Self::new();
        store
            .state
            .lock()
            .await
            .resources
            .insert(resource_name.to_string(), Resource::default());
        store
    }

    /// Make the next `count` acquire calls fail with [`LeaseStoreError::Unavailable`].
    pub async fn fail_next_acquires(&self, count: usize) {
        self.state.lock().await.fail_acquires = count;
    }

    /// Make the next `count` renew calls fail with [`LeaseStoreError::Unavailable`].
    pub async fn fail_next_renewals(&self, count: usize) {
        self.state.lock().await.fail_renewals = count;
    }

    /// Make the next `count` release calls fail with [`LeaseStoreError::Unavailable`].
    pub async fn fail_next_releases(&self, count: usize) {
        self.state.lock().await.fail_releases = count;
    }

    /// Delay every subsequent call by `latency` before it takes effect.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    /// Hand the lease on `resource_name` to `owner_id`, regardless of the current holder.
    ///
    /// Returns the new token.
    pub async fn steal(&self, resource_name: &str, owner_id: &str, timeout: Duration) -> String {
        let token = format!("stolen-{}", uuid::Uuid::new_v4());
        let mut state = self.state.lock().await;
        state
            .resources
            .entry(resource_name.to_string())
            .or_default()
            .lease = Some(ActiveLease {
            token: token.clone(),
            owner_id: owner_id.to_string(),
            expires_at: Instant::now() + timeout,
        });
        token
    }

    /// Drop the resource entirely, as if the backing object was deleted.
    pub async fn delete_resource(&self, resource_name: &str) {
        self.state.lock().await.resources.remove(resource_name);
    }

    /// Token of the active lease on `resource_name`, if any.
    pub async fn active_token(&self, resource_name: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .resources
            .get(resource_name)
            .and_then(|r| r.active(Instant::now()))
            .map(|l| l.token.clone())
    }

    /// Number of try_acquire calls made so far.
    pub fn acquire_calls(&self) -> usize {
        self.counters.acquire.load(Ordering::SeqCst)
    }

    /// Number of renew calls made so far.
    pub fn renew_calls(&self) -> usize {
        self.counters.renew.load(Ordering::SeqCst)
    }

    /// Number of release calls made so far.
    pub fn release_calls(&self) -> usize {
        self.counters.release.load(Ordering::SeqCst)
    }

    /// Number of create_resource_if_missing calls made so far.
    pub fn create_calls(&self) -> usize {
        self.counters.create.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    fn store_type(&self) -> &'static str {
        "memory"
    }

    async fn try_acquire(
        &self,
        resource_name: &str,
        owner_id: &str,
        proposed_token: &str,
        timeout: Duration,
    ) -> Result<AcquireOutcome> {
        self.counters.acquire.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.counters);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if state.fail_acquires > 0 {
            state.fail_acquires -= 1;
            return Err(LeaseStoreError::Unavailable(
                "injected acquire failure".to_string(),
            ));
        }

        let now = Instant::now();
        let resource = state
            .resources
            .get_mut(resource_name)
            .ok_or_else(|| LeaseStoreError::ResourceMissing(resource_name.to_string()))?;

        if resource.active(now).is_some() {
            return Ok(AcquireOutcome::Contended);
        }

        resource.lease = Some(ActiveLease {
            token: proposed_token.to_string(),
            owner_id: owner_id.to_string(),
            expires_at: now + timeout,
        });

        Ok(AcquireOutcome::Acquired(LeaseHandle {
            resource_name: resource_name.to_string(),
            token: proposed_token.to_string(),
        }))
    }

    async fn renew(&self, handle: &LeaseHandle, timeout: Duration) -> Result<RenewOutcome> {
        self.counters.renew.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.counters);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if state.fail_renewals > 0 {
            state.fail_renewals -= 1;
            return Err(LeaseStoreError::Unavailable(
                "injected renew failure".to_string(),
            ));
        }

        let now = Instant::now();
        let resource = state
            .resources
            .get_mut(&handle.resource_name)
            .ok_or_else(|| LeaseStoreError::ResourceMissing(handle.resource_name.clone()))?;

        match resource.lease.as_mut() {
            Some(lease) if lease.token == handle.token && lease.expires_at > now => {
                lease.expires_at = now + timeout;
                Ok(RenewOutcome::Renewed)
            }
            _ => Ok(RenewOutcome::Lost),
        }
    }

    async fn release(&self, handle: &LeaseHandle) -> Result<()> {
        self.counters.release.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.counters);
        self.simulate_latency().await;

        let mut state = self.state.lock().await;
        if state.fail_releases > 0 {
            state.fail_releases -= 1;
            return Err(LeaseStoreError::Unavailable(
                "injected release failure".to_string(),
            ));
        }

        if let Some(resource) = state.resources.get_mut(&handle.resource_name)
            && resource
                .lease
                .as_ref()
                .is_some_and(|l| l.token == handle.token)
        {
            resource.lease = None;
        }
        Ok(())
    }

    async fn create_resource_if_missing(&self, resource_name: &str) -> Result<bool> {
        self.counters.create.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.resources.contains_key(resource_name) {
            return Ok(false);
        }
        state
            .resources
            .insert(resource_name.to_string(), Resource::default());
        Ok(true)
    }

    async fn get_owner(&self, resource_name: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .resources
            .get(resource_name)
            .and_then(|r| r.active(Instant::now()))
            .map(|l| l.owner_id.clone()))
    }
}
