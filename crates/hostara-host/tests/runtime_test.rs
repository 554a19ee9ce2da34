// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for HostRuntime over the in-memory lease store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use hostara_host::host::{HostState, MockHostFactory, RestartReason};
use hostara_host::lease::{LeaseStore, MemoryLeaseStore};
use hostara_host::runtime::{HostRuntime, HostRuntimeConfig};

use common::{eventually, fast_lifecycle, lease_options};

const HOST_ID: &str = "app";

fn runtime_config(
    store: &Arc<MemoryLeaseStore>,
    factory: &Arc<MockHostFactory>,
    instance_id: &str,
) -> HostRuntimeConfig {
    HostRuntime::builder()
        .lease_store(store.clone())
        .host_factory(factory.clone())
        .host_id(HOST_ID)
        .instance_id(instance_id)
        .lease_options(lease_options())
        .lifecycle_options(fast_lifecycle())
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_primary_host_is_rebuilt_as_primary() {
    let store = Arc::new(MemoryLeaseStore::with_resource(HOST_ID).await);
    let factory = Arc::new(MockHostFactory::new());
    let runtime = runtime_config(&store, &factory, "node-a")
        .start()
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(10), || {
            runtime.is_primary()
                && runtime.can_invoke()
                && runtime
                    .manager()
                    .current_instance()
                    .is_some_and(|current| current.is_primary())
        })
        .await
    );

    let latest = factory.latest().unwrap();
    assert!(latest.context().is_primary);
    assert!(latest.context().primary.as_ref().unwrap().is_primary());
    assert_eq!(
        runtime.lock_owner().await.unwrap().as_deref(),
        Some("node-a")
    );

    runtime.shutdown().await.unwrap();
    assert_eq!(store.active_token(HOST_ID).await, None);
    assert_eq!(factory.running(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_losing_the_lease_restarts_host_as_secondary() {
    let store = Arc::new(MemoryLeaseStore::with_resource(HOST_ID).await);
    let factory = Arc::new(MockHostFactory::new());
    let runtime = runtime_config(&store, &factory, "node-a")
        .start()
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(10), || {
            runtime
                .manager()
                .current_instance()
                .is_some_and(|current| current.is_primary())
        })
        .await
    );
    let starts_before = runtime.manager().start_count();

    store
        .steal(HOST_ID, "node-b", Duration::from_secs(600))
        .await;

    // Loss is noticed on the next renewal, 17s after the last one.
    assert!(
        eventually(Duration::from_secs(30), || {
            !runtime.is_primary()
                && runtime.can_invoke()
                && runtime
                    .manager()
                    .current_instance()
                    .is_some_and(|current| !current.is_primary())
        })
        .await
    );
    assert!(runtime.manager().start_count() > starts_before);
    assert_eq!(
        runtime.lock_owner().await.unwrap().as_deref(),
        Some("node-b")
    );

    runtime.shutdown().await.unwrap();
    // Foreign lease is untouched by our shutdown.
    assert!(store.active_token(HOST_ID).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_lease_change_restart_can_be_disabled() {
    let store = Arc::new(MemoryLeaseStore::with_resource(HOST_ID).await);
    store
        .steal(HOST_ID, "node-b", Duration::from_secs(20))
        .await;
    let factory = Arc::new(MockHostFactory::new());
    let runtime = HostRuntime::builder()
        .lease_store(store.clone())
        .host_factory(factory.clone())
        .host_id(HOST_ID)
        .instance_id("node-a")
        .lease_options(lease_options())
        .restart_on_lease_change(false)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    assert!(runtime.wait_until_ready(Duration::from_secs(5)).await);
    assert!(eventually(Duration::from_secs(60), || runtime.is_primary()).await);

    assert_eq!(runtime.manager().start_count(), 1);
    assert!(!factory.latest().unwrap().context().is_primary);
    // The running host still sees the live flag.
    assert!(factory.latest().unwrap().context().primary.as_ref().unwrap().is_primary());

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_two_processes_elect_one_primary_and_fail_over() {
    let store = Arc::new(MemoryLeaseStore::with_resource(HOST_ID).await);
    let factory_a = Arc::new(MockHostFactory::new());
    let factory_b = Arc::new(MockHostFactory::new());

    let a = runtime_config(&store, &factory_a, "node-a")
        .start()
        .await
        .unwrap();
    let b = runtime_config(&store, &factory_b, "node-b")
        .start()
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(10), || a.is_primary() || b.is_primary()).await);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(a.is_primary() ^ b.is_primary());

    let (primary, standby) = if a.is_primary() { (a, b) } else { (b, a) };
    let standby_id = standby.instance_id().to_string();

    primary.shutdown().await.unwrap();

    // Released on shutdown, so the standby takes over on its next 5s poll.
    assert!(eventually(Duration::from_secs(6), || standby.is_primary()).await);
    assert_eq!(
        store.get_owner(HOST_ID).await.unwrap().as_deref(),
        Some(standby_id.as_str())
    );

    standby.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_status_reflects_runtime() {
    let store = Arc::new(MemoryLeaseStore::with_resource(HOST_ID).await);
    let factory = Arc::new(MockHostFactory::new());
    let runtime = runtime_config(&store, &factory, "node-a")
        .start()
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(10), || {
            runtime.is_primary()
                && runtime
                    .manager()
                    .current_instance()
                    .is_some_and(|current| current.is_primary())
        })
        .await
    );

    let status = runtime.status();
    assert_eq!(status.host_id, HOST_ID);
    assert_eq!(status.instance_id, "node-a");
    assert!(status.is_primary);
    assert_eq!(status.state, HostState::Running);
    assert!(status.current_generation.is_some());
    assert!(status.last_error.is_none());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "running");
    assert_eq!(json["is_primary"], true);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_request_restart_through_runtime() {
    let factory = Arc::new(MockHostFactory::new());
    let runtime = HostRuntime::builder()
        .host_factory(factory.clone())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    assert!(runtime.wait_until_ready(Duration::from_secs(5)).await);
    assert!(runtime.request_restart(RestartReason::Requested));
    assert!(
        eventually(Duration::from_secs(5), || {
            runtime.manager().start_count() == 2 && runtime.can_invoke()
        })
        .await
    );
    assert!(runtime.is_running());

    runtime.shutdown().await.unwrap();
    assert_eq!(factory.total_disposes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_endless_start_releases_lease() {
    let store = Arc::new(MemoryLeaseStore::with_resource(HOST_ID).await);
    let factory = Arc::new(MockHostFactory::with_start_delay(Duration::from_secs(3600)));
    let runtime = HostRuntime::builder()
        .lease_store(store.clone())
        .host_factory(factory.clone())
        .host_id(HOST_ID)
        .instance_id("node-a")
        .lease_options(lease_options())
        .lifecycle_options(fast_lifecycle())
        .shutdown_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(10), || runtime.is_primary()).await);
    assert!(!runtime.can_invoke());

    let finished = tokio::time::timeout(Duration::from_secs(120), runtime.shutdown()).await;
    assert!(matches!(finished, Ok(Ok(()))));

    assert_eq!(store.active_token(HOST_ID).await, None);
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.total_disposes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_timeout_leaves_stopping_hosts_to_finish() {
    let factory = Arc::new(MockHostFactory::with_stop_delay(Duration::from_secs(10)));
    let runtime = HostRuntime::builder()
        .host_factory(factory.clone())
        .shutdown_timeout(Duration::from_secs(1))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.wait_until_ready(Duration::from_secs(5)).await);

    runtime.shutdown().await.unwrap();

    // Gave up waiting after 1s; the stop is still in progress.
    assert_eq!(factory.total_stops(), 1);
    assert_eq!(factory.total_disposes(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(factory.instances()[0].dispose_calls(), 1);
}
