// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease module - primary election over a shared lease store.

pub mod coordinator;
pub mod memory;
pub mod postgres;
pub mod primary;
mod traits;

pub use coordinator::{LeaseCoordinator, LeaseCoordinatorHandle};
pub use memory::MemoryLeaseStore;
pub use postgres::PostgresLeaseStore;
pub use primary::{LeaseTransition, PrimaryState};
pub use traits::*;
