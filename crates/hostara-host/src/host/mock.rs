// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock host factory for testing.
//!
//! Instances do no work; they only count lifecycle calls so tests can check
//! that every generation is started once and stopped/disposed once.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::traits::*;

/// Mock host instance.
#[derive(Debug)]
pub struct MockHostInstance {
    context: HostContext,
    start_delay: Duration,
    stop_delay: Duration,
    fail_start: bool,
    fail_stop: bool,
    fail_dispose: bool,
    started: AtomicUsize,
    stopped: AtomicUsize,
    disposed: AtomicUsize,
    running: AtomicBool,
}

impl MockHostInstance {
    /// Context the instance was constructed with.
    pub fn context(&self) -> &HostContext {
        &self.context
    }

    /// Generation number.
    pub fn generation(&self) -> u64 {
        self.context.generation
    }

    /// Number of `start` calls.
    pub fn start_calls(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls.
    pub fn stop_calls(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of `dispose` calls.
    pub fn dispose_calls(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether start completed and stop has not been called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostInstance for MockHostInstance {
    async fn start(&self) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start {
            return Err(HostError::StartFailed("Mock start failure".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        if self.fail_stop {
            return Err(HostError::StopFailed("Mock stop failure".to_string()));
        }
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        if self.fail_dispose {
            return Err(HostError::DisposeFailed("Mock dispose failure".to_string()));
        }
        Ok(())
    }
}

/// Mock factory for testing.
#[derive(Debug, Default)]
pub struct MockHostFactory {
    instances: Mutex<Vec<Arc<MockHostInstance>>>,
    /// Delay inside every `start` call
    pub start_delay: Duration,
    /// Delay inside every `stop` call
    pub stop_delay: Duration,
    /// If true, `stop` returns an error after running
    pub fail_stop: bool,
    /// If true, `dispose` returns an error
    pub fail_dispose: bool,
    fail_next_starts: AtomicUsize,
    fail_next_creates: AtomicUsize,
}

impl MockHostFactory {
    /// Create a new mock factory with no delays.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory whose instances take `delay` to stop.
    pub fn with_stop_delay(delay: Duration) -> Self {
        Self {
            stop_delay: delay,
            ..Self::default()
        }
    }

    /// Create a factory whose instances take `delay` to start.
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    /// Create a factory whose instances fail both `stop` and `dispose`.
    pub fn failing_teardown() -> Self {
        Self {
            fail_stop: true,
            fail_dispose: true,
            ..Self::default()
        }
    }

    /// Make the next `n` constructed instances fail to start.
    pub fn fail_next_starts(&self, n: usize) {
        self.fail_next_starts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` `create` calls fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_next_creates.store(n, Ordering::SeqCst);
    }

    /// Every instance created so far, oldest first.
    pub fn instances(&self) -> Vec<Arc<MockHostInstance>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recently created instance.
    pub fn latest(&self) -> Option<Arc<MockHostInstance>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Number of instances created.
    pub fn created(&self) -> usize {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total `start` calls across all instances.
    pub fn total_starts(&self) -> usize {
        self.instances().iter().map(|i| i.start_calls()).sum()
    }

    /// Total `stop` calls across all instances.
    pub fn total_stops(&self) -> usize {
        self.instances().iter().map(|i| i.stop_calls()).sum()
    }

    /// Total `dispose` calls across all instances.
    pub fn total_disposes(&self) -> usize {
        self.instances().iter().map(|i| i.dispose_calls()).sum()
    }

    /// Number of instances currently running.
    pub fn running(&self) -> usize {
        self.instances().iter().filter(|i| i.is_running()).count()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl HostInstanceFactory for MockHostFactory {
    async fn create(&self, context: HostContext) -> Result<Arc<dyn HostInstance>> {
        if take_one(&self.fail_next_creates) {
            return Err(HostError::CreateFailed("Mock create failure".to_string()));
        }

        let instance = Arc::new(MockHostInstance {
            context,
            start_delay: self.start_delay,
            stop_delay: self.stop_delay,
            fail_start: take_one(&self.fail_next_starts),
            fail_stop: self.fail_stop,
            fail_dispose: self.fail_dispose,
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            disposed: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        });

        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance.clone());

        Ok(instance)
    }
}
