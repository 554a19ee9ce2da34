// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostara Host - Primary Election and Host Lifecycle
//!
//! This crate is the runtime host of a horizontally scaled function
//! execution platform. Many stateless processes run against the same
//! application identity. Each one runs a single execution engine (a "host
//! instance") and replaces it when configuration, code or its primary role
//! changes. Exactly one process in the fleet is primary at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         hostara-host process                            │
//! │                                                                         │
//! │  ┌────────────────────┐  PrimaryState   ┌────────────────────────────┐  │
//! │  │  LeaseCoordinator  │ ──────────────► │   HostLifecycleManager     │  │
//! │  │  acquire / renew   │  (watch +       │   create → run → orphan    │  │
//! │  │  every 5s / T-3s   │   broadcast)    │                            │  │
//! │  └─────────┬──────────┘                 │  ┌──────────────────────┐  │  │
//! │            │                            │  │ HostInstanceRegistry │  │  │
//! │            │                            │  │ current + orphans    │  │  │
//! │            │                            │  └──────────────────────┘  │  │
//! │            │                            └─────────────┬──────────────┘  │
//! └────────────┼──────────────────────────────────────────┼─────────────────┘
//!              │                                          │ start / stop / dispose
//!              ▼                                          ▼
//! ┌──────────────────────────┐               ┌──────────────────────────────┐
//! │       LeaseStore         │               │   HostInstance (generation)  │
//! │  PostgreSQL host_leases  │               │   HostInstanceFactory        │
//! │  or in-memory            │               └──────────────────────────────┘
//! └──────────────────────────┘
//! ```
//!
//! # Primary Election
//!
//! The lease is a row keyed by host id with a token, an owner and an expiry
//! evaluated on the database clock. A process that finds the lease free (or
//! expired) takes it with a fresh token and renews it every
//! `timeout - 3s`. Any renewal failure gives up the role at once, so the
//! failover window is bounded by the lease timeout.
//!
//! | Lease timeout | Renewal | Idle poll |
//! |---------------|---------|-----------|
//! | 15s (default) | 12s     | 5s        |
//! | 20s           | 17s     | 5s        |
//! | 60s (maximum) | 57s     | 5s        |
//!
//! # Host Generations
//!
//! ```text
//!   Created ──start──► Running (current) ──restart──► Orphaned ──► Disposed
//! ```
//!
//! At most one generation is current. A restart hands the current one to a
//! background drain task and constructs the next generation immediately.
//! Shutdown stops every live generation, orphans included.
//!
//! # Configuration
//!
//! The binary reads its configuration from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `HOSTARA_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `HOSTARA_HOST_ID` | Yes | - | Application identity; lease resource name |
//! | `HOSTARA_INSTANCE_ID` | No | random UUID | Identity of this process |
//! | `HOSTARA_LEASE_TIMEOUT_SECS` | No | `15` | Lease timeout, 15 to 60 |
//! | `HOSTARA_LEASE_RENEWAL_SECS` | No | timeout - 3 | Renewal interval |
//! | `HOSTARA_RESTART_ON_LEASE_CHANGE` | No | `true` | Restart host on primary change |
//!
//! # Modules
//!
//! - [`config`]: Lease and lifecycle options, environment configuration
//! - [`error`]: Error types for host runtime operations
//! - [`lease`]: Lease stores, primary state and the lease coordinator
//! - [`host`]: Host instances, registry and the lifecycle manager
//! - [`runtime`]: Embeddable runtime wiring election to the host loop
//! - [`migrations`]: Embedded database migrations

#![deny(missing_docs)]

/// Database migrations for the PostgreSQL lease store.
pub mod migrations;

/// Lease and lifecycle options loaded from code or environment variables.
pub mod config;

/// Error types for host runtime operations.
pub mod error;

/// Primary election over a shared lease store.
pub mod lease;

/// Host instance generations and their lifecycle.
pub mod host;

/// Embeddable runtime for hostara-host.
pub mod runtime;

pub use config::Config;
pub use error::{Error, Result};
