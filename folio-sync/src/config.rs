//! Coordinator configuration.

use crate::conflict::ConflictResolutionStrategy;
use folio_types::DeviceInfo;
use rand::Rng;
use std::time::Duration;

/// Configuration for a [`crate::SyncCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// This installation, as announced to peers.
    pub local_device: DeviceInfo,
    /// How conflicting edits are settled.
    pub conflict_strategy: ConflictResolutionStrategy,
    /// Bound on the Hello/HelloAck exchange.
    pub handshake_timeout: Duration,
    /// Bound on receiving the remote manifest.
    pub manifest_timeout: Duration,
    /// Bound on each data message during transfer.
    pub transfer_timeout: Duration,
    /// Backoff for transient connect and send failures.
    pub retry: RetryConfig,
    /// Window within which reading-progress writes collapse into one.
    pub debounce_window: Duration,
    /// Period of the background auto-sync loop.
    pub auto_sync_interval: Duration,
    /// A device not re-announced within this window is dropped.
    pub discovery_expiry: Duration,
    /// How often the discovery session checks for expired devices.
    pub discovery_sweep_interval: Duration,
    /// Only devices on the trusted list may connect.
    pub require_trusted_devices: bool,
    /// Worker threads for diffing large manifests.
    pub diff_workers: usize,
}

impl CoordinatorConfig {
    /// Creates a configuration with default timings for `local_device`.
    pub fn new(local_device: DeviceInfo) -> Self {
        Self {
            local_device,
            conflict_strategy: ConflictResolutionStrategy::LatestTimestamp,
            handshake_timeout: Duration::from_secs(15),
            manifest_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
            debounce_window: Duration::from_secs(2),
            auto_sync_interval: Duration::from_secs(60),
            discovery_expiry: Duration::from_secs(30),
            discovery_sweep_interval: Duration::from_secs(5),
            require_trusted_devices: false,
            diff_workers: 4,
        }
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictResolutionStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_manifest_timeout(mut self, timeout: Duration) -> Self {
        self.manifest_timeout = timeout;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    pub fn with_auto_sync_interval(mut self, interval: Duration) -> Self {
        self.auto_sync_interval = interval;
        self
    }

    /// Sets the discovery expiry window and sweep cadence.
    pub fn with_discovery_timing(mut self, expiry: Duration, sweep: Duration) -> Self {
        self.discovery_expiry = expiry;
        self.discovery_sweep_interval = sweep;
        self
    }

    pub fn with_trusted_devices_only(mut self, required: bool) -> Self {
        self.require_trusted_devices = required;
        self
    }

    pub fn with_diff_workers(mut self, workers: usize) -> Self {
        self.diff_workers = workers.max(1);
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with `max_attempts` attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Delay before attempt `attempt` (0-indexed; the first attempt has none).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let delay_secs = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
