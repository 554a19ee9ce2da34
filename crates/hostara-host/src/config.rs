// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for hostara-host.

use std::time::Duration;

use uuid::Uuid;

/// Shortest lease timeout accepted by [`LeaseOptions::new`].
pub const MIN_LEASE_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest lease timeout accepted by [`LeaseOptions::new`].
pub const MAX_LEASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Renewal happens this long before the lease would expire.
pub const RENEWAL_SAFETY_MARGIN: Duration = Duration::from_secs(3);

/// Poll interval used while the lease is not held.
pub const DEFAULT_ACQUIRE_INTERVAL: Duration = Duration::from_secs(5);

/// Validated lease timing.
///
/// Construction fails for out-of-range values so a bad timeout is rejected
/// when the host is configured, not on the first acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseOptions {
    timeout: Duration,
    renewal_interval: Option<Duration>,
    acquire_interval: Duration,
}

impl LeaseOptions {
    /// Create options for the given lease timeout (15s to 60s inclusive).
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        if !(MIN_LEASE_TIMEOUT..=MAX_LEASE_TIMEOUT).contains(&timeout) {
            return Err(ConfigError::LeaseTimeoutOutOfRange(timeout));
        }

        Ok(Self {
            timeout,
            renewal_interval: None,
            acquire_interval: DEFAULT_ACQUIRE_INTERVAL,
        })
    }

    /// Override the renewal interval. Must be non-zero and shorter than the timeout.
    pub fn with_renewal_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() || interval >= self.timeout {
            return Err(ConfigError::InvalidRenewalInterval {
                interval,
                timeout: self.timeout,
            });
        }
        self.renewal_interval = Some(interval);
        Ok(self)
    }

    /// Override the poll interval used while the lease is not held.
    pub fn with_acquire_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "acquire_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.acquire_interval = interval;
        Ok(self)
    }

    /// Lease timeout requested from the store.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cadence while the lease is held (`timeout - 3s` unless overridden).
    pub fn renewal_interval(&self) -> Duration {
        self.renewal_interval
            .unwrap_or(self.timeout - RENEWAL_SAFETY_MARGIN)
    }

    /// Cadence while the lease is not held.
    pub fn acquire_interval(&self) -> Duration {
        self.acquire_interval
    }
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            timeout: MIN_LEASE_TIMEOUT,
            renewal_interval: None,
            acquire_interval: DEFAULT_ACQUIRE_INTERVAL,
        }
    }
}

/// Options for the host lifecycle loop.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// First delay after a failed host start.
    pub restart_backoff_min: Duration,
    /// Upper bound for the startup failure backoff.
    pub restart_backoff_max: Duration,
    /// Whether shutdown also waits for orphans that are still draining.
    pub await_orphans_on_shutdown: bool,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            restart_backoff_min: Duration::from_secs(1),
            restart_backoff_max: Duration::from_secs(120),
            await_orphans_on_shutdown: true,
        }
    }
}

impl LifecycleOptions {
    /// Backoff before the next attempt after `consecutive_errors` failed starts.
    pub fn restart_backoff(&self, consecutive_errors: u32) -> Duration {
        let exponent = consecutive_errors.saturating_sub(1).min(16);
        self.restart_backoff_min
            .saturating_mul(1u32 << exponent)
            .min(self.restart_backoff_max)
    }
}

/// Host process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL of the shared lease store
    pub database_url: String,
    /// Logical application identity; used as the lease resource name
    pub host_id: String,
    /// Identity of this process within the fleet
    pub instance_id: String,
    /// Lease timing
    pub lease: LeaseOptions,
    /// Restart the active host whenever primacy changes
    pub restart_on_lease_change: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("HOSTARA_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("HOSTARA_DATABASE_URL"))?;

        let host_id = std::env::var("HOSTARA_HOST_ID")
            .map_err(|_| ConfigError::MissingEnvVar("HOSTARA_HOST_ID"))?;

        let instance_id = std::env::var("HOSTARA_INSTANCE_ID")
            .unwrap_or_else(|_| Uuid::new_v4().to_string());

        let timeout_secs = parse_secs("HOSTARA_LEASE_TIMEOUT_SECS")?
            .unwrap_or(MIN_LEASE_TIMEOUT.as_secs());
        let mut lease = LeaseOptions::new(Duration::from_secs(timeout_secs))?;
        if let Some(renewal_secs) = parse_secs("HOSTARA_LEASE_RENEWAL_SECS")? {
            lease = lease.with_renewal_interval(Duration::from_secs(renewal_secs))?;
        }

        let restart_on_lease_change = std::env::var("HOSTARA_RESTART_ON_LEASE_CHANGE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            host_id,
            instance_id,
            lease,
            restart_on_lease_change,
        })
    }
}

fn parse_secs(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                name,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// Lease timeout outside the accepted range.
    #[error("Lease timeout {0:?} is outside the allowed range of 15s to 60s")]
    LeaseTimeoutOutOfRange(Duration),
    /// Renewal interval is zero or not shorter than the lease timeout.
    #[error("Renewal interval {interval:?} must be greater than zero and less than the lease timeout {timeout:?}")]
    InvalidRenewalInterval {
        /// Requested renewal interval.
        interval: Duration,
        /// Configured lease timeout.
        timeout: Duration,
    },
    /// A value could not be parsed or is not allowed.
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue {
        /// Setting name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
