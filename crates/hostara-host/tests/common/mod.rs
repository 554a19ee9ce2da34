// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test helpers for hostara-host integration tests.

#![allow(dead_code)]

use std::time::Duration;

use hostara_host::config::{LeaseOptions, LifecycleOptions};

/// Poll `condition` every 10ms until it holds or `within` elapses.
///
/// Works with paused tokio time: each poll sleep lets the clock auto-advance.
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let spawned tasks run without moving paused time noticeably.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// 20 second lease: renewals every 17s, idle polls every 5s.
pub fn lease_options() -> LeaseOptions {
    LeaseOptions::new(Duration::from_secs(20)).expect("20s is a valid lease timeout")
}

/// Lifecycle options with short backoff for tests.
pub fn fast_lifecycle() -> LifecycleOptions {
    LifecycleOptions {
        restart_backoff_min: Duration::from_millis(50),
        restart_backoff_max: Duration::from_millis(200),
        ..LifecycleOptions::default()
    }
}
