//! Cloud channel and reconnect configuration.

use std::time::Duration;

use rand::RngExt;

use tether_core::config::{CloudConfig, ReconnectConfig};

/// Settings for one connection to the cloud.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Cloud endpoint (`ws://` or `wss://`).
    pub cloud_url: String,

    /// How often a `ping` is sent.
    pub heartbeat_interval: Duration,

    /// Silence after which the channel is considered dead.
    pub heartbeat_timeout: Duration,

    /// Bound on TCP + TLS + WebSocket upgrade.
    pub connect_timeout: Duration,

    /// Bound on waiting for `auth_ack`.
    pub auth_timeout: Duration,

    /// Bound on flushing queued frames during a graceful close.
    pub flush_timeout: Duration,

    /// Outbound queue depth.
    pub outbound_capacity: usize,

    /// Inbound work queue depth.
    pub inbound_capacity: usize,
}

impl ChannelConfig {
    /// Create a channel config for `cloud_url` with defaults.
    pub fn new(cloud_url: impl Into<String>) -> Self {
        Self::from_cloud(&CloudConfig {
            url: cloud_url.into(),
            ..CloudConfig::default()
        })
    }

    pub fn from_cloud(cloud: &CloudConfig) -> Self {
        Self {
            cloud_url: cloud.url.clone(),
            heartbeat_interval: cloud.heartbeat_interval(),
            heartbeat_timeout: cloud.heartbeat_timeout(),
            connect_timeout: cloud.connect_timeout(),
            auth_timeout: cloud.auth_timeout(),
            flush_timeout: Duration::from_secs(5),
            outbound_capacity: 128,
            inbound_capacity: 64,
        }
    }
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Fraction of each delay that is randomized; 0 disables jitter.
    pub jitter: f64,
    /// Connected time after which the failure counter resets.
    pub stable_threshold: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
            stable_threshold: Duration::from_secs(config.stable_threshold_secs),
        }
    }

    /// Same policy with jitter disabled.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Un-jittered delay after `failures` consecutive failures (0-indexed).
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn base_delay(&self, failures: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(i32::try_from(failures).unwrap_or(i32::MAX));
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Scale `base` by a factor in `[1 - jitter, 1]`; `unit` is in `[0, 1]`.
    pub fn jittered(&self, base: Duration, unit: f64) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        base.mul_f64(1.0 - jitter * unit.clamp(0.0, 1.0))
    }

    /// Delay to wait after `failures` consecutive failures.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures);
        if self.jitter <= 0.0 {
            return base;
        }
        self.jittered(base, rand::rng().random_range(0.0..=1.0))
    }
}

/// Failure counter driven by a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay for the current failure count, then count one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for_attempt(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Record how long a connection stayed up; resets the counter when it
    /// was stable. Returns whether a reset happened.
    pub fn record_uptime(&mut self, uptime: Duration) -> bool {
        if uptime >= self.policy.stable_threshold && self.failures > 0 {
            self.failures = 0;
            return true;
        }
        false
    }
}
