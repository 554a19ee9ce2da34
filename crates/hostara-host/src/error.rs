// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hostara-host.

use thiserror::Error;

/// Host runtime errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migrations could not be applied.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Lease store operation failed.
    #[error("Lease store error: {0}")]
    LeaseStore(#[from] crate::lease::LeaseStoreError),
}

/// Result type using the host runtime Error.
pub type Result<T> = std::result::Result<T, Error>;
