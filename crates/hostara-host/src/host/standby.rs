// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Standby host used by the `hostara-host` binary.
//!
//! It runs no functions. It reports which generation is live and whether it
//! holds the primary role, which is enough to observe election and restart
//! behavior across a fleet of processes sharing one database.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::info;

use super::traits::*;

/// Factory for [`StandbyHost`] instances.
#[derive(Debug, Clone, Default)]
pub struct StandbyHostFactory {
    host_id: String,
}

impl StandbyHostFactory {
    /// Create a factory for the host identified by `host_id`.
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
        }
    }
}

#[async_trait]
impl HostInstanceFactory for StandbyHostFactory {
    async fn create(&self, context: HostContext) -> Result<Arc<dyn HostInstance>> {
        Ok(Arc::new(StandbyHost {
            host_id: self.host_id.clone(),
            context,
            watcher: Mutex::new(None),
        }))
    }
}

/// Host instance that only logs its own lifecycle.
pub struct StandbyHost {
    host_id: String,
    context: HostContext,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl HostInstance for StandbyHost {
    async fn start(&self) -> Result<()> {
        info!(
            host_id = %self.host_id,
            generation = self.context.generation,
            instance_id = %self.context.instance_id,
            is_primary = self.context.is_primary,
            "Standby host ready"
        );

        if let Some(primary) = &self.context.primary {
            let mut transitions = primary.transitions();
            let generation = self.context.generation;
            let handle = tokio::spawn(async move {
                loop {
                    match transitions.recv().await {
                        Ok(transition) => info!(
                            generation,
                            is_primary = transition.is_primary(),
                            "Primary role changed under running host"
                        ),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            });
            *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        info!(
            host_id = %self.host_id,
            generation = self.context.generation,
            "Standby host stopped"
        );
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::signal::RestartSignal;

    #[tokio::test]
    async fn test_standby_host_starts_and_stops() {
        let factory = StandbyHostFactory::new("app");
        let host = factory
            .create(HostContext {
                generation: 1,
                instance_id: "g1".to_string(),
                is_primary: false,
                primary: None,
                restart: RestartSignal::new(),
            })
            .await
            .unwrap();

        host.start().await.unwrap();
        host.stop().await.unwrap();
        host.dispose().unwrap();
    }
}
