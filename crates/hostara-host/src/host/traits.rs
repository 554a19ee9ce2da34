// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host instance trait definitions.
//!
//! A host instance is one generation of the execution engine. What happens
//! inside `start` (function indexing, worker startup, listener binding) is
//! opaque to the lifecycle manager.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use super::signal::RestartSignal;
use crate::lease::PrimaryState;

/// Errors from host instance operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    /// The instance could not be constructed.
    #[error("Host creation failed: {0}")]
    CreateFailed(String),

    /// The instance failed to start.
    #[error("Host start failed: {0}")]
    StartFailed(String),

    /// The instance failed to stop cleanly.
    #[error("Host stop failed: {0}")]
    StopFailed(String),

    /// Releasing instance resources failed.
    #[error("Host dispose failed: {0}")]
    DisposeFailed(String),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for host operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Everything a new generation is told when it is constructed.
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Monotonic generation number (1 for the first host of this process)
    pub generation: u64,
    /// Unique id of this generation
    pub instance_id: String,
    /// Whether this process held the primary lease at construction time
    pub is_primary: bool,
    /// Live primary flag, when lease coordination is enabled
    pub primary: Option<PrimaryState>,
    /// Signal the instance can fire to ask for its own replacement
    pub restart: RestartSignal,
}

/// Trait for host instances.
///
/// Instances are owned exclusively by the lifecycle manager; nothing else
/// stops or disposes them.
#[async_trait]
pub trait HostInstance: Send + Sync {
    /// Start accepting work. May take arbitrarily long.
    async fn start(&self) -> Result<()>;

    /// Stop accepting new work and let in-flight invocations finish.
    async fn stop(&self) -> Result<()>;

    /// Release all resources. Called once, after `stop`.
    fn dispose(&self) -> Result<()>;
}

/// Builds a fresh host instance for every generation.
#[async_trait]
pub trait HostInstanceFactory: Send + Sync {
    /// Construct (but do not start) a new instance.
    async fn create(&self, context: HostContext) -> Result<Arc<dyn HostInstance>>;
}
