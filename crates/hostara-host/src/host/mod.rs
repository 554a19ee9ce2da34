// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host module - host instance generations and their lifecycle.

pub mod manager;
pub mod mock;
pub mod registry;
pub mod signal;
pub mod standby;
mod traits;

pub use manager::{HostFailure, HostLifecycleManager, HostState};
pub use mock::{MockHostFactory, MockHostInstance};
pub use registry::{HostGeneration, HostInstanceRegistry, InstanceLifecycle};
pub use signal::{RestartReason, RestartSignal};
pub use standby::StandbyHostFactory;
pub use traits::*;
