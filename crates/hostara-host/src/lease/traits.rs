// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease store trait definitions.
//!
//! Defines the abstract interface for the shared storage primitive that
//! backs primary election.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors from lease store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LeaseStoreError {
    /// The named lease resource does not exist yet.
    #[error("Lease resource not found: {0}")]
    ResourceMissing(String),

    /// The store could not be reached or answered with a server-side fault.
    #[error("Lease store unavailable: {0}")]
    Unavailable(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for lease store operations.
pub type Result<T> = std::result::Result<T, LeaseStoreError>;

/// Proof of ownership handed out by a store on a successful acquire.
///
/// Renew and release must present the same token; a stale owner whose
/// token was superseded is refused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LeaseHandle {
    /// Name of the leased resource
    pub resource_name: String,
    /// Fencing token
    pub token: String,
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease is now held by the caller.
    Acquired(LeaseHandle),
    /// Another owner holds an unexpired lease.
    Contended,
}

/// Outcome of a renew attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// The lease was extended by another timeout period.
    Renewed,
    /// The lease expired or was taken over by someone else.
    Lost,
}

/// A lease currently held by this process.
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    /// Handle returned by the store
    pub handle: LeaseHandle,
    /// Identity that acquired the lease
    pub owner_id: String,
    /// Timeout requested on acquire and renew
    pub timeout: Duration,
    /// When the lease was acquired
    pub acquired_at: DateTime<Utc>,
    /// Completion time of the last successful acquire or renew
    pub last_renewal: DateTime<Utc>,
    /// Duration of that call
    pub last_renewal_latency: Duration,
}

impl Lease {
    /// Fencing token of the held lease.
    pub fn token(&self) -> &str {
        &self.handle.token
    }

    /// Time elapsed since the last successful renewal.
    pub fn since_last_renewal(&self) -> Duration {
        (Utc::now() - self.last_renewal).to_std().unwrap_or_default()
    }
}

/// Trait for lease stores.
///
/// A store offers try-acquire, renew and release of a named, time-bound
/// exclusive lock. The store's atomic acquire is what provides exclusion
/// across the fleet; callers never rely on in-process locking for it.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Store type identifier (e.g., "postgres", "memory")
    fn store_type(&self) -> &'static str;

    /// Try to take the lease on `resource_name`.
    ///
    /// Returns [`AcquireOutcome::Contended`] when another owner holds an
    /// unexpired lease and [`LeaseStoreError::ResourceMissing`] when the
    /// resource has never been created.
    async fn try_acquire(
        &self,
        resource_name: &str,
        owner_id: &str,
        proposed_token: &str,
        timeout: Duration,
    ) -> Result<AcquireOutcome>;

    /// Extend a held lease by `timeout`.
    async fn renew(&self, handle: &LeaseHandle, timeout: Duration) -> Result<RenewOutcome>;

    /// Give up a held lease. Releasing a lease that already expired or was
    /// taken over is not an error.
    async fn release(&self, handle: &LeaseHandle) -> Result<()>;

    /// Create the named resource if it does not exist.
    ///
    /// Returns true when this call created it.
    async fn create_resource_if_missing(&self, resource_name: &str) -> Result<bool>;

    /// Owner recorded with the active lease, or `None` if the lease is available.
    async fn get_owner(&self, resource_name: &str) -> Result<Option<String>>;
}
