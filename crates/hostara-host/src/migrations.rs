// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for hostara-host.
//!
//! Creates the `host_leases` table used by
//! [`PostgresLeaseStore`](crate::lease::PostgresLeaseStore).
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use hostara_host::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run(&pool).await?;
//!
//! // or both in one step
//! let pool = migrations::connect(&database_url, 5).await?;
//! ```

use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgPoolOptions;

/// Migrations embedded at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply all pending migrations.
pub async fn run(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Open a connection pool and apply pending migrations.
pub async fn connect(database_url: &str, max_connections: u32) -> crate::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    run(&pool).await?;
    Ok(pool)
}
