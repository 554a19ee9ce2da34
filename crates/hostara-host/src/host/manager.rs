// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host lifecycle manager.
//!
//! Runs one generation of the host at a time and replaces it on request:
//!
//! ```text
//!   ┌─────────┐  start ok   ┌─────────┐  restart   ┌──────────┐  stop+dispose  ┌──────────┐
//!   │ Created │ ──────────► │ Running │ ─────────► │ Orphaned │ ─────────────► │ Disposed │
//!   └─────────┘             └─────────┘  (async)   └──────────┘                └──────────┘
//!        │ start failed                                ▲
//!        └─────────────────────────────────────────────┘  then backoff, next generation
//! ```
//!
//! The next generation is constructed as soon as the previous one is handed
//! to an orphan task; draining never delays it. Shutdown takes every live
//! generation out of the registry and stops them all.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::{HostGeneration, HostInstanceRegistry};
use super::signal::{RestartReason, RestartSignal};
use super::traits::{HostContext, HostError, HostInstanceFactory};
use crate::config::LifecycleOptions;
use crate::lease::PrimaryState;

/// Process-level state of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    /// No generation running, or a restart was just requested.
    Default,
    /// A generation is being constructed or started.
    Starting,
    /// The current generation started and accepts invocations.
    Running,
    /// The last start attempt failed; waiting to retry.
    Error,
    /// Shutdown has begun. Terminal.
    Stopped,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostState::Default => "default",
            HostState::Starting => "starting",
            HostState::Running => "running",
            HostState::Error => "error",
            HostState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A generation that failed to come up.
#[derive(Debug, Clone, Serialize)]
pub struct HostFailure {
    /// Generation number that failed
    pub generation: u64,
    /// Instance id of that generation
    pub instance_id: String,
    /// Error message
    pub error: String,
    /// Failures in a row, including this one
    pub consecutive_errors: u32,
    /// When the failure was observed
    pub at: DateTime<Utc>,
}

/// What a restart request currently targets.
enum PendingRestart {
    Idle,
    Generation(RestartSignal),
    Backoff(Arc<Notify>),
}

/// Drives the create → run → orphan loop for one host process.
pub struct HostLifecycleManager {
    factory: Arc<dyn HostInstanceFactory>,
    registry: Arc<HostInstanceRegistry>,
    primary: Option<PrimaryState>,
    options: LifecycleOptions,
    stopped: AtomicBool,
    shutdown: Notify,
    pending: Mutex<PendingRestart>,
    state: watch::Sender<HostState>,
    failures: broadcast::Sender<HostFailure>,
    last_error: Mutex<Option<String>>,
    consecutive_errors: AtomicU32,
    start_count: AtomicU64,
    latest_role: Mutex<Option<bool>>,
    orphans: Mutex<JoinSet<()>>,
}

impl HostLifecycleManager {
    /// Create a manager that builds generations with `factory`.
    pub fn new(factory: Arc<dyn HostInstanceFactory>, options: LifecycleOptions) -> Self {
        let (state, _) = watch::channel(HostState::Default);
        let (failures, _) = broadcast::channel(16);
        Self {
            factory,
            registry: Arc::new(HostInstanceRegistry::new()),
            primary: None,
            options,
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
            pending: Mutex::new(PendingRestart::Idle),
            state,
            failures,
            last_error: Mutex::new(None),
            consecutive_errors: AtomicU32::new(0),
            start_count: AtomicU64::new(0),
            latest_role: Mutex::new(None),
            orphans: Mutex::new(JoinSet::new()),
        }
    }

    /// Pass the primary flag into every generation this manager builds.
    pub fn with_primary_state(mut self, primary: PrimaryState) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Spawn the manager loop onto the runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run().await })
    }

    /// Current host state.
    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    /// Receiver notified on every host state change.
    pub fn subscribe_state(&self) -> watch::Receiver<HostState> {
        self.state.subscribe()
    }

    /// Whether new invocations may be routed to the host.
    pub fn can_invoke(&self) -> bool {
        self.state() == HostState::Running
    }

    /// Wait until the host is running.
    ///
    /// Returns false if `timeout` elapses first or the host ends up in the
    /// `Error` or `Stopped` state.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let settled = rx.wait_for(|state| {
            matches!(
                state,
                HostState::Running | HostState::Error | HostState::Stopped
            )
        });
        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(state)) => *state == HostState::Running,
            _ => false,
        }
    }

    /// Message of the most recent start failure.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Start failures in a row since the last successful start.
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    /// Stream of start failures.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<HostFailure> {
        self.failures.subscribe()
    }

    /// Number of generations constructed so far.
    pub fn start_count(&self) -> u64 {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Live generations.
    pub fn registry(&self) -> &Arc<HostInstanceRegistry> {
        &self.registry
    }

    /// The generation accepting new work, if any.
    pub fn current_instance(&self) -> Option<Arc<HostGeneration>> {
        self.registry.current()
    }

    /// Whether shutdown has begun.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Ask for the current generation to be replaced.
    ///
    /// The host state drops back to `Default` right away so callers stop
    /// routing new work. During a startup backoff the remaining delay is
    /// skipped. Returns false if there was nothing to restart.
    pub fn request_restart(&self, reason: RestartReason) -> bool {
        if self.is_stopped() {
            debug!(reason = %reason, "Ignoring restart request; host is stopping");
            return false;
        }

        // State and signal change together so a starting generation cannot
        // be promoted to Running in between.
        let mut requested = false;
        self.state.send_if_modified(|state| {
            requested = match &*lock(&self.pending) {
                PendingRestart::Generation(signal) => {
                    let fired = signal.request(reason);
                    if fired {
                        info!(reason = %reason, "Host restart requested");
                    }
                    fired
                }
                PendingRestart::Backoff(cancel) => {
                    info!(reason = %reason, "Host restart requested; skipping startup backoff");
                    cancel.notify_one();
                    true
                }
                PendingRestart::Idle => false,
            };

            if matches!(*state, HostState::Default | HostState::Stopped) {
                false
            } else {
                debug!(from = %state, to = %HostState::Default, "Host state changed");
                *state = HostState::Default;
                true
            }
        });
        requested
    }

    /// Restart if the newest generation was built with a different primary
    /// role than the one currently held.
    ///
    /// A generation that is still starting counts as the newest one, so it is
    /// left alone when it already saw the new role. Returns true if a restart
    /// was requested.
    pub fn restart_on_role_change(&self) -> bool {
        let Some(primary) = &self.primary else {
            return false;
        };

        let role = lock(&self.latest_role);
        let is_primary = primary.is_primary();
        if *role == Some(is_primary) {
            debug!(is_primary, "Newest host already has this role");
            return false;
        }

        info!(is_primary, "Primary lease changed; restarting host");
        self.request_restart(RestartReason::LeaseChanged)
    }

    /// Primary role the newest generation was constructed with.
    pub fn latest_role(&self) -> Option<bool> {
        *lock(&self.latest_role)
    }

    /// Run the lifecycle loop until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        info!("Host lifecycle manager started");

        while !self.is_stopped() {
            let generation = self.start_count.fetch_add(1, Ordering::SeqCst) + 1;
            let instance_id = Uuid::new_v4().to_string();
            let restart = RestartSignal::new();
            let is_primary = {
                let mut role = lock(&self.latest_role);
                *lock(&self.pending) = PendingRestart::Generation(restart.clone());
                let is_primary = self.primary.as_ref().is_some_and(|p| p.is_primary());
                *role = Some(is_primary);
                is_primary
            };

            if self.state() != HostState::Error {
                self.set_state(HostState::Starting);
            }

            info!(
                generation,
                instance_id = %instance_id,
                is_primary,
                "Starting host"
            );

            let context = HostContext {
                generation,
                instance_id: instance_id.clone(),
                is_primary,
                primary: self.primary.clone(),
                restart: restart.clone(),
            };

            let instance = match self.factory.create(context).await {
                Ok(instance) => instance,
                Err(e) => {
                    if self.recover_from_failure(generation, &instance_id, e, None).await {
                        continue;
                    }
                    break;
                }
            };

            let current = Arc::new(HostGeneration::new(
                instance_id.clone(),
                generation,
                is_primary,
                instance,
                restart.clone(),
            ));
            self.registry.insert(current.clone());

            if self.is_stopped() {
                self.registry.orphan(&current).await;
                break;
            }

            let started = tokio::select! {
                biased;

                _ = self.shutdown.notified() => None,
                result = current.instance().start() => Some(result),
            };

            let Some(started) = started else {
                debug!(
                    generation,
                    instance_id = %instance_id,
                    "Shutdown interrupted host start"
                );
                break;
            };

            if let Err(e) = started {
                if self
                    .recover_from_failure(generation, &instance_id, e, Some(current))
                    .await
                {
                    continue;
                }
                break;
            }

            if !current.mark_running() || !self.registry.mark_current(current.id()) {
                debug!(
                    generation,
                    instance_id = %instance_id,
                    "Host was drained by shutdown while starting"
                );
                break;
            }

            self.consecutive_errors.store(0, Ordering::SeqCst);
            self.promote_to_running(&restart);
            info!(generation, instance_id = %instance_id, "Host started");

            let reason = tokio::select! {
                biased;

                _ = self.shutdown.notified() => None,
                reason = restart.wait() => Some(reason),
            };

            let Some(reason) = reason else {
                break;
            };
            if self.is_stopped() {
                break;
            }

            info!(
                generation,
                instance_id = %instance_id,
                reason = %reason,
                "Restarting host"
            );
            self.spawn_orphan(current);
        }

        *lock(&self.pending) = PendingRestart::Idle;
        info!("Host lifecycle manager stopped");
    }

    /// Record a failed generation, orphan it and wait out the backoff.
    ///
    /// Returns false if shutdown began while waiting.
    async fn recover_from_failure(
        &self,
        generation: u64,
        instance_id: &str,
        error: HostError,
        failed: Option<Arc<HostGeneration>>,
    ) -> bool {
        // Restart requests from here on cut the backoff short.
        let cancel = Arc::new(Notify::new());
        *lock(&self.pending) = PendingRestart::Backoff(cancel.clone());

        let consecutive_errors = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        let message = error.to_string();

        error!(
            generation,
            instance_id = %instance_id,
            consecutive_errors,
            error = %message,
            "A host error has occurred"
        );

        *lock(&self.last_error) = Some(message.clone());
        self.set_state(HostState::Error);
        // No receivers is fine; last_error keeps the message.
        let _ = self.failures.send(HostFailure {
            generation,
            instance_id: instance_id.to_string(),
            error: message,
            consecutive_errors,
            at: Utc::now(),
        });

        if let Some(failed) = failed {
            self.spawn_orphan(failed);
        }

        if self.is_stopped() {
            return false;
        }

        let delay = self.options.restart_backoff(consecutive_errors);
        info!(
            generation,
            delay_ms = delay.as_millis() as u64,
            "Retrying host start after backoff"
        );

        let resume = tokio::select! {
            biased;

            _ = self.shutdown.notified() => false,
            _ = cancel.notified() => true,
            _ = tokio::time::sleep(delay) => true,
        };

        *lock(&self.pending) = PendingRestart::Idle;
        resume && !self.is_stopped()
    }

    fn spawn_orphan(&self, generation: Arc<HostGeneration>) {
        let registry = self.registry.clone();
        let mut orphans = lock(&self.orphans);

        while let Some(result) = orphans.try_join_next() {
            if let Err(e) = result {
                warn!("Host orphan task failed: {}", e);
            }
        }

        orphans.spawn(async move {
            registry.orphan(&generation).await;
        });
    }

    /// Move to Running unless a restart was already requested for this
    /// generation or shutdown began.
    fn promote_to_running(&self, restart: &RestartSignal) -> bool {
        self.state.send_if_modified(|state| {
            if restart.is_requested()
                || matches!(*state, HostState::Running | HostState::Stopped)
            {
                false
            } else {
                debug!(from = %state, to = %HostState::Running, "Host state changed");
                *state = HostState::Running;
                true
            }
        })
    }

    fn set_state(&self, next: HostState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == HostState::Stopped {
                false
            } else {
                debug!(from = %current, to = %next, "Host state changed");
                *current = next;
                true
            }
        });
    }

    /// Stop the loop and every live generation. Idempotent.
    ///
    /// Generations are stopped concurrently. Orphans that are still draining
    /// are awaited unless `await_orphans_on_shutdown` is off. Teardown runs on
    /// its own task, so dropping this future stops the waiting but not the
    /// stop/dispose work.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Stopping host lifecycle manager");
        self.state.send_replace(HostState::Stopped);
        self.shutdown.notify_one();

        let live = self.registry.drain();
        let drained = live.len();
        let orphans = std::mem::take(&mut *lock(&self.orphans));

        let handle = tokio::spawn(teardown(
            live,
            orphans,
            self.options.await_orphans_on_shutdown,
        ));
        if let Err(e) = handle.await {
            error!("Host teardown task panicked: {}", e);
        }

        info!(drained, "Host lifecycle manager shut down");
    }
}

/// Stop and dispose every drained generation, then deal with the orphans.
async fn teardown(
    live: Vec<Arc<HostGeneration>>,
    mut orphans: JoinSet<()>,
    await_orphans: bool,
) {
    let mut stopping = JoinSet::new();
    for generation in live {
        stopping.spawn(async move {
            generation.stop_and_dispose().await;
        });
    }
    while let Some(result) = stopping.join_next().await {
        if let Err(e) = result {
            error!("Host stop task panicked: {}", e);
        }
    }

    if await_orphans {
        let pending = orphans.len();
        while let Some(result) = orphans.join_next().await {
            if let Err(e) = result {
                warn!("Host orphan task failed: {}", e);
            }
        }
        debug!(orphans = pending, "Orphaned hosts drained");
    } else {
        orphans.detach_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
