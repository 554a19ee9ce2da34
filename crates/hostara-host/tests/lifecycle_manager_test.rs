// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the host lifecycle manager - restarts, orphan draining and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use hostara_host::config::LifecycleOptions;
use hostara_host::host::{
    HostContext, HostGeneration, HostInstanceFactory, HostInstanceRegistry, HostLifecycleManager,
    HostState, InstanceLifecycle, MockHostFactory, RestartReason, RestartSignal,
};
use hostara_host::lease::{LeaseCoordinator, MemoryLeaseStore};

use common::{eventually, fast_lifecycle, lease_options};

const WAIT: Duration = Duration::from_secs(5);

fn manager(factory: &Arc<MockHostFactory>, options: LifecycleOptions) -> Arc<HostLifecycleManager> {
    Arc::new(HostLifecycleManager::new(factory.clone(), options))
}

async fn wait_for_generation(manager: &HostLifecycleManager, generation: u64) -> bool {
    eventually(WAIT, || {
        manager.can_invoke()
            && manager
                .current_instance()
                .is_some_and(|current| current.generation() == generation)
    })
    .await
}

#[tokio::test]
async fn test_three_restarts_give_three_replacements() {
    let factory = Arc::new(MockHostFactory::new());
    let manager = manager(&factory, fast_lifecycle());
    let task = manager.spawn();

    assert!(wait_for_generation(&manager, 1).await);

    for generation in 2..=4 {
        assert!(manager.request_restart(RestartReason::ConfigurationChanged));
        assert!(wait_for_generation(&manager, generation).await);
        assert_eq!(factory.running(), 1);
    }

    assert!(eventually(WAIT, || factory.total_disposes() == 3).await);
    assert_eq!(factory.created(), 4);
    assert_eq!(factory.total_starts(), 4);
    assert_eq!(factory.total_stops(), 3);
    assert_eq!(manager.start_count(), 4);
    assert_eq!(manager.registry().len(), 1);

    let instances = factory.instances();
    for old in &instances[..3] {
        assert_eq!(old.stop_calls(), 1);
        assert_eq!(old.dispose_calls(), 1);
    }
    assert!(instances[3].is_running());

    manager.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_restart_does_not_wait_for_orphan_to_drain() {
    let factory = Arc::new(MockHostFactory::with_stop_delay(Duration::from_secs(2)));
    let manager = manager(&factory, fast_lifecycle());
    let task = manager.spawn();
    assert!(wait_for_generation(&manager, 1).await);

    manager.request_restart(RestartReason::Requested);
    assert!(
        tokio::time::timeout(Duration::from_millis(500), async {
            wait_for_generation(&manager, 2).await
        })
        .await
        .unwrap_or(false)
    );

    // Generation 1 is still stopping; it is no longer current or registered.
    assert_eq!(factory.total_disposes(), 0);
    assert_eq!(manager.registry().len(), 1);

    manager.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_double_orphan_runs_one_stop_dispose_cycle() {
    let factory = MockHostFactory::with_stop_delay(Duration::from_millis(50));
    let registry = HostInstanceRegistry::new();
    let restart = RestartSignal::new();
    let instance = factory
        .create(HostContext {
            generation: 1,
            instance_id: "g1".to_string(),
            is_primary: false,
            primary: None,
            restart: restart.clone(),
        })
        .await
        .unwrap();
    let generation = Arc::new(HostGeneration::new("g1", 1, false, instance, restart));
    registry.insert(generation.clone());
    registry.mark_current("g1");

    let (first, second) = tokio::join!(registry.orphan(&generation), registry.orphan(&generation));

    assert!(first != second);
    assert_eq!(factory.total_stops(), 1);
    assert_eq!(factory.total_disposes(), 1);
    assert!(registry.is_empty());
    assert_eq!(generation.lifecycle(), InstanceLifecycle::Disposed);
}

#[tokio::test]
async fn test_shutdown_drains_current_and_orphans() {
    let factory = Arc::new(MockHostFactory::with_stop_delay(Duration::from_millis(300)));
    let manager = manager(&factory, fast_lifecycle());
    let task = manager.spawn();
    assert!(wait_for_generation(&manager, 1).await);

    manager.request_restart(RestartReason::ConfigurationChanged);
    assert!(wait_for_generation(&manager, 2).await);
    manager.request_restart(RestartReason::ConfigurationChanged);
    assert!(wait_for_generation(&manager, 3).await);

    // Two orphans are mid-stop when shutdown begins.
    assert_eq!(factory.total_disposes(), 0);
    manager.shutdown().await;
    task.await.unwrap();

    assert_eq!(factory.created(), 3);
    assert_eq!(factory.total_stops(), 3);
    assert_eq!(factory.total_disposes(), 3);
    assert_eq!(factory.running(), 0);
    assert!(manager.registry().is_empty());
    assert!(manager.current_instance().is_none());
    assert_eq!(manager.state(), HostState::Stopped);
}

#[tokio::test]
async fn test_shutdown_can_skip_waiting_for_orphans() {
    let factory = Arc::new(MockHostFactory::with_stop_delay(Duration::from_millis(500)));
    let options = LifecycleOptions {
        await_orphans_on_shutdown: false,
        ..fast_lifecycle()
    };
    let manager = manager(&factory, options);
    let task = manager.spawn();
    assert!(wait_for_generation(&manager, 1).await);

    manager.request_restart(RestartReason::Requested);
    assert!(wait_for_generation(&manager, 2).await);

    manager.shutdown().await;
    task.await.unwrap();

    // Current generation is always stopped; the detached orphan finishes later.
    assert_eq!(factory.instances()[1].dispose_calls(), 1);
    assert!(eventually(WAIT, || factory.total_disposes() == 2).await);
}

#[tokio::test]
async fn test_restart_racing_shutdown_starts_no_new_generation() {
    let factory = Arc::new(MockHostFactory::new());
    let manager = manager(&factory, fast_lifecycle());
    let task = manager.spawn();
    assert!(wait_for_generation(&manager, 1).await);

    manager.request_restart(RestartReason::ConfigurationChanged);
    manager.shutdown().await;
    task.await.unwrap();

    assert_eq!(manager.start_count(), 1);
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.total_stops(), 1);
    assert_eq!(factory.total_disposes(), 1);
}

#[tokio::test]
async fn test_shutdown_during_slow_start_disposes_starting_generation() {
    let factory = Arc::new(MockHostFactory::with_start_delay(Duration::from_millis(300)));
    let manager = manager(&factory, fast_lifecycle());
    let task = manager.spawn();

    assert!(eventually(WAIT, || factory.created() == 1).await);
    manager.shutdown().await;
    task.await.unwrap();

    assert_eq!(manager.start_count(), 1);
    assert_eq!(factory.total_disposes(), 1);
    assert!(manager.current_instance().is_none());
    assert!(!manager.can_invoke());
}

#[tokio::test]
async fn test_start_failure_publishes_error_and_recovers() {
    let factory = Arc::new(MockHostFactory::new());
    factory.fail_next_starts(1);
    let manager = manager(&factory, fast_lifecycle());
    let mut failures = manager.subscribe_failures();
    let mut state = manager.subscribe_state();
    let task = manager.spawn();

    let failure = tokio::time::timeout(WAIT, failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.generation, 1);
    assert_eq!(failure.consecutive_errors, 1);
    assert!(failure.error.contains("Mock start failure"));
    assert!(
        manager
            .last_error()
            .is_some_and(|e| e.contains("Mock start failure"))
    );

    tokio::time::timeout(WAIT, state.wait_for(|s| *s == HostState::Running))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(manager.current_instance().unwrap().generation(), 2);
    assert_eq!(manager.consecutive_errors(), 0);
    assert!(eventually(WAIT, || factory.instances()[0].dispose_calls() == 1).await);

    manager.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_wait_until_ready_reports_error_state() {
    let factory = Arc::new(MockHostFactory::new());
    factory.fail_next_starts(1);
    let options = LifecycleOptions {
        restart_backoff_min: Duration::from_secs(60),
        restart_backoff_max: Duration::from_secs(60),
        ..LifecycleOptions::default()
    };
    let manager = manager(&factory, options);
    let task = manager.spawn();

    assert!(!manager.wait_until_ready(WAIT).await);
    assert_eq!(manager.state(), HostState::Error);
    assert!(!manager.can_invoke());

    manager.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_restart_request_cancels_startup_backoff() {
    let factory = Arc::new(MockHostFactory::new());
    factory.fail_next_starts(1);
    let options = LifecycleOptions {
        restart_backoff_min: Duration::from_secs(60),
        restart_backoff_max: Duration::from_secs(60),
        ..LifecycleOptions::default()
    };
    let manager = manager(&factory, options);
    let mut failures = manager.subscribe_failures();
    let task = manager.spawn();

    tokio::time::timeout(WAIT, failures.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(eventually(WAIT, || manager.state() == HostState::Error).await);

    assert!(manager.request_restart(RestartReason::ConfigurationChanged));
    assert!(wait_for_generation(&manager, 2).await);

    manager.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_create_failure_is_retried() {
    let factory = Arc::new(MockHostFactory::new());
    factory.fail_next_creates(2);
    let manager = manager(&factory, fast_lifecycle());
    let task = manager.spawn();

    assert!(wait_for_generation(&manager, 3).await);
    assert_eq!(factory.created(), 1);
    assert_eq!(manager.start_count(), 3);

    manager.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_stop_and_dispose_failures_do_not_block_next_generation() {
    let factory = Arc::new(MockHostFactory::failing_teardown());
    let manager = manager(&factory, fast_lifecycle());
    let task = manager.spawn();
    assert!(wait_for_generation(&manager, 1).await);

    manager.request_restart(RestartReason::FatalError);
    assert!(wait_for_generation(&manager, 2).await);
    assert!(eventually(WAIT, || factory.instances()[0].dispose_calls() == 1).await);
    assert_eq!(factory.instances()[0].stop_calls(), 1);

    manager.request_restart(RestartReason::FatalError);
    assert!(wait_for_generation(&manager, 3).await);

    manager.shutdown().await;
    task.await.unwrap();
    assert_eq!(factory.total_disposes(), 3);
}

#[tokio::test]
async fn test_instance_can_request_its_own_restart() {
    let factory = Arc::new(MockHostFactory::new());
    let manager = manager(&factory, fast_lifecycle());
    let task = manager.spawn();
    assert!(wait_for_generation(&manager, 1).await);

    let first = factory.latest().unwrap();
    assert!(first.context().restart.request(RestartReason::FatalError));
    assert!(wait_for_generation(&manager, 2).await);

    manager.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_abandoned_shutdown_still_disposes_generations() {
    let factory = Arc::new(MockHostFactory::with_stop_delay(Duration::from_millis(500)));
    let manager = manager(&factory, fast_lifecycle());
    let task = manager.spawn();
    assert!(wait_for_generation(&manager, 1).await);

    let waited = tokio::time::timeout(Duration::from_millis(100), manager.shutdown()).await;
    assert!(waited.is_err());
    assert_eq!(manager.state(), HostState::Stopped);

    assert!(eventually(WAIT, || factory.total_disposes() == 1).await);
    task.await.unwrap();
}

#[tokio::test]
async fn test_role_change_skips_generation_built_with_new_role() {
    let store = Arc::new(MemoryLeaseStore::with_resource("app").await);
    let coordinator = LeaseCoordinator::new(store, "app", "node-a", lease_options());
    coordinator.tick().await;
    assert!(coordinator.is_primary());

    let factory = Arc::new(MockHostFactory::with_start_delay(Duration::from_millis(500)));
    let manager = Arc::new(
        HostLifecycleManager::new(factory.clone(), fast_lifecycle())
            .with_primary_state(coordinator.primary_state()),
    );
    let task = manager.spawn();

    // Still starting, already built as primary.
    assert!(eventually(WAIT, || factory.created() == 1).await);
    assert!(manager.current_instance().is_none());
    assert_eq!(manager.latest_role(), Some(true));
    assert!(!manager.restart_on_role_change());

    assert!(wait_for_generation(&manager, 1).await);
    assert!(manager.current_instance().unwrap().is_primary());

    coordinator.release().await;
    assert!(manager.restart_on_role_change());
    assert!(wait_for_generation(&manager, 2).await);
    assert!(!manager.current_instance().unwrap().is_primary());
    assert!(!manager.restart_on_role_change());

    manager.shutdown().await;
    task.await.unwrap();
}
