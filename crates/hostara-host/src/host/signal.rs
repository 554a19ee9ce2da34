// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One-shot restart signal.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Why a generation was asked to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// Configuration or function code changed.
    ConfigurationChanged,
    /// This process gained or lost the primary lease.
    LeaseChanged,
    /// An external caller asked for a restart.
    Requested,
    /// The instance hit an error it cannot recover from.
    FatalError,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestartReason::ConfigurationChanged => "configuration_changed",
            RestartReason::LeaseChanged => "lease_changed",
            RestartReason::Requested => "requested",
            RestartReason::FatalError => "fatal_error",
        };
        f.write_str(s)
    }
}

/// Restart request for a single generation.
///
/// Any code path may fire it; only the first reason is kept. Clones share
/// the same signal.
#[derive(Debug, Clone)]
pub struct RestartSignal {
    tx: Arc<watch::Sender<Option<RestartReason>>>,
}

impl Default for RestartSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartSignal {
    /// Create an unfired signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Returns false if it had already fired.
    pub fn request(&self, reason: RestartReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        })
    }

    /// Whether the signal has fired.
    pub fn is_requested(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Reason the signal fired with, if it has.
    pub fn reason(&self) -> Option<RestartReason> {
        *self.tx.borrow()
    }

    /// Wait until the signal fires and return its reason.
    pub async fn wait(&self) -> RestartReason {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
