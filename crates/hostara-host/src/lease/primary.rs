// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Primary state shared with the rest of the host.
//!
//! The flag has exactly one writer, the lease coordinator. Everyone else
//! holds a [`PrimaryState`] reader and can either take a snapshot or wait for
//! the next transition. Because readers come from a `watch` channel, reading
//! the current value and subscribing to changes cannot race.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

/// A crossing of the held/not-held boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeaseTransition {
    /// The lease was acquired; this host is now primary.
    Acquired {
        /// Identity that acquired the lease
        owner_id: String,
        /// When the transition happened
        at: DateTime<Utc>,
    },
    /// The lease could not be renewed; this host is no longer primary.
    Lost {
        /// Identity that held the lease
        owner_id: String,
        /// When the transition happened
        at: DateTime<Utc>,
    },
    /// The lease was given up on shutdown.
    Released {
        /// Identity that held the lease
        owner_id: String,
        /// When the transition happened
        at: DateTime<Utc>,
    },
}

impl LeaseTransition {
    /// Primary flag after this transition.
    pub fn is_primary(&self) -> bool {
        matches!(self, LeaseTransition::Acquired { .. })
    }
}

/// Read-only view of the primary flag.
#[derive(Debug, Clone)]
pub struct PrimaryState {
    rx: watch::Receiver<bool>,
    transitions: broadcast::Sender<LeaseTransition>,
}

impl PrimaryState {
    /// Whether this host currently holds the primary lease.
    pub fn is_primary(&self) -> bool {
        *self.rx.borrow()
    }

    /// A receiver that is notified only when the flag flips.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    /// Stream of every transition, in order.
    pub fn transitions(&self) -> broadcast::Receiver<LeaseTransition> {
        self.transitions.subscribe()
    }

    /// Wait until the flag equals `primary`.
    ///
    /// Returns false if the writer went away before that happened.
    pub async fn wait_for(&self, primary: bool) -> bool {
        let mut rx = self.rx.clone();
        rx.wait_for(|value| *value == primary).await.is_ok()
    }
}

/// The single writer of the primary flag.
#[derive(Debug)]
pub(crate) struct PrimaryStateWriter {
    tx: watch::Sender<bool>,
    transitions: broadcast::Sender<LeaseTransition>,
}

impl PrimaryStateWriter {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        let (transitions, _) = broadcast::channel(64);
        Self { tx, transitions }
    }

    pub(crate) fn reader(&self) -> PrimaryState {
        PrimaryState {
            rx: self.tx.subscribe(),
            transitions: self.transitions.clone(),
        }
    }

    /// Publish a transition. Watchers are only woken if the flag actually flips.
    pub(crate) fn publish(&self, transition: LeaseTransition) -> bool {
        let primary = transition.is_primary();
        let changed = self.tx.send_if_modified(|current| {
            if *current == primary {
                false
            } else {
                *current = primary;
                true
            }
        });
        if changed {
            // No receivers is fine; the watch channel already holds the state.
            let _ = self.transitions.send(transition);
        }
        changed
    }

    pub(crate) fn is_primary(&self) -> bool {
        *self.tx.borrow()
    }
}
