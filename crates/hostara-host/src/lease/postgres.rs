// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL lease store.
//!
//! Every lease resource is one row in `host_leases`. Acquire is a single
//! conditional `UPDATE`, so two hosts racing for an expired lease serialize on
//! the row lock and only one of them sees its update applied. Expiry is always
//! compared against the database clock, which keeps clock drift between hosts
//! out of the exclusion decision.

use async_trait::async_trait;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::traits::*;

/// Lease store backed by the `host_leases` table.
#[derive(Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
    request_timeout: Duration,
}

impl PostgresLeaseStore {
    /// Create a new store on top of an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Bound each store call. A call that exceeds it fails as unavailable.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(LeaseStoreError::from),
            Err(_) => Err(LeaseStoreError::Unavailable(format!(
                "{} timed out after {}ms",
                operation,
                self.request_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    fn store_type(&self) -> &'static str {
        "postgres"
    }

    async fn try_acquire(
        &self,
        resource_name: &str,
        owner_id: &str,
        proposed_token: &str,
        timeout: Duration,
    ) -> Result<AcquireOutcome> {
        let acquired: Option<(String,)> = self
            .timed(
                "acquire",
                sqlx::query_as(
                    r#"
                    UPDATE host_leases
                    SET lease_token = $2,
                        owner_id = $3,
                        expires_at = NOW() + make_interval(secs => $4),
                        acquired_at = NOW(),
                        renewed_at = NOW()
                    WHERE resource_name = $1
                      AND (lease_token IS NULL OR expires_at IS NULL OR expires_at <= NOW())
                    RETURNING lease_token
                    "#,
                )
                .bind(resource_name)
                .bind(proposed_token)
                .bind(owner_id)
                .bind(timeout.as_secs_f64())
                .fetch_optional(&self.pool),
            )
            .await?;

        if let Some((token,)) = acquired {
            return Ok(AcquireOutcome::Acquired(LeaseHandle {
                resource_name: resource_name.to_string(),
                token,
            }));
        }

        // Nothing updated: either someone holds it or the row does not exist.
        let (exists,): (bool,) = self
            .timed(
                "acquire",
                sqlx::query_as("SELECT EXISTS(SELECT 1 FROM host_leases WHERE resource_name = $1)")
                    .bind(resource_name)
                    .fetch_one(&self.pool),
            )
            .await?;

        if exists {
            Ok(AcquireOutcome::Contended)
        } else {
            Err(LeaseStoreError::ResourceMissing(resource_name.to_string()))
        }
    }

    async fn renew(&self, handle: &LeaseHandle, timeout: Duration) -> Result<RenewOutcome> {
        let result = self
            .timed(
                "renew",
                sqlx::query(
                    r#"
                    UPDATE host_leases
                    SET expires_at = NOW() + make_interval(secs => $3),
                        renewed_at = NOW()
                    WHERE resource_name = $1
                      AND lease_token = $2
                      AND expires_at > NOW()
                    "#,
                )
                .bind(&handle.resource_name)
                .bind(&handle.token)
                .bind(timeout.as_secs_f64())
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 1 {
            Ok(RenewOutcome::Renewed)
        } else {
            Ok(RenewOutcome::Lost)
        }
    }

    async fn release(&self, handle: &LeaseHandle) -> Result<()> {
        let result = self
            .timed(
                "release",
                sqlx::query(
                    r#"
                    UPDATE host_leases
                    SET lease_token = NULL,
                        expires_at = NULL
                    WHERE resource_name = $1
                      AND lease_token = $2
                    "#,
                )
                .bind(&handle.resource_name)
                .bind(&handle.token)
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            debug!(
                resource = %handle.resource_name,
                "Lease already released or taken over; nothing to release"
            );
        }
        Ok(())
    }

    async fn create_resource_if_missing(&self, resource_name: &str) -> Result<bool> {
        let result = self
            .timed(
                "create",
                sqlx::query(
                    r#"
                    INSERT INTO host_leases (resource_name)
                    VALUES ($1)
                    ON CONFLICT (resource_name) DO NOTHING
                    "#,
                )
                .bind(resource_name)
                .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_owner(&self, resource_name: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = self
            .timed(
                "get_owner",
                sqlx::query_as(
                    r#"
                    SELECT owner_id
                    FROM host_leases
                    WHERE resource_name = $1
                      AND lease_token IS NOT NULL
                      AND expires_at > NOW()
                    "#,
                )
                .bind(resource_name)
                .fetch_optional(&self.pool),
            )
            .await?;

        Ok(row.and_then(|(owner,)| owner))
    }
}
