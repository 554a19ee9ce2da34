// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostara Host - standalone host process
//!
//! Competes for the primary lease of `HOSTARA_HOST_ID` and keeps a standby
//! host generation running, replacing it whenever primacy changes.

use std::sync::Arc;
use tracing::{info, warn};

use hostara_host::config::Config;
use hostara_host::host::StandbyHostFactory;
use hostara_host::lease::PostgresLeaseStore;
use hostara_host::migrations;
use hostara_host::runtime::HostRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostara_host=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        host_id = %config.host_id,
        instance_id = %config.instance_id,
        lease_timeout_secs = config.lease.timeout().as_secs(),
        renewal_interval_secs = config.lease.renewal_interval().as_secs(),
        "Starting Hostara Host"
    );

    // Connect to database and apply migrations
    let pool = migrations::connect(&config.database_url, 5).await?;

    info!("Connected to database; schema verified");

    let store = Arc::new(PostgresLeaseStore::new(pool));
    let factory = Arc::new(StandbyHostFactory::new(&config.host_id));

    // Start the runtime
    let runtime = HostRuntime::builder()
        .lease_store(store)
        .host_factory(factory)
        .host_id(&config.host_id)
        .instance_id(&config.instance_id)
        .lease_options(config.lease)
        .restart_on_lease_change(config.restart_on_lease_change)
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    match serde_json::to_string(&runtime.status()) {
        Ok(status) => info!(status = %status, "Final host status"),
        Err(e) => warn!("Failed to serialize host status: {}", e),
    }

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Hostara Host shut down");

    Ok(())
}
