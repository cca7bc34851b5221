//! Session tuning knobs.

use std::time::Duration;

use peerlink_common::helpers::{env_bool, env_u64};
use peerlink_common::Error;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Limit for one authentication attempt.
    pub handshake_timeout: Duration,
    /// Limit for reaching the channel-open stage after a join.
    pub transport_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Reconnect attempts before giving up with `MaxRetriesExceeded`.
    pub max_reconnect_attempts: u32,
    pub health_checks: bool,
    pub health_interval: Duration,
    pub rtt_degraded_ms: u64,
    /// Fraction of recent pings left unanswered that counts as degraded.
    pub loss_degraded: f64,
    pub max_missed_pings: u32,
    /// Accepted clock skew for handshake and session messages.
    pub replay_window: Duration,
    pub max_buffered_bytes: usize,
    pub max_crypto_failures: u32,
    pub crypto_failure_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            transport_timeout: Duration::from_secs(15),
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(30_000),
            max_reconnect_attempts: 5,
            health_checks: true,
            health_interval: Duration::from_secs(15),
            rtt_degraded_ms: 1_000,
            loss_degraded: 0.2,
            max_missed_pings: 3,
            replay_window: Duration::from_secs(300),
            max_buffered_bytes: 16 * 1024 * 1024,
            max_crypto_failures: 8,
            crypto_failure_window: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `PEERLINK_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            Duration::from_millis(env_u64(name, default.as_millis() as u64))
        };

        Self {
            handshake_timeout: millis("PEERLINK_HANDSHAKE_TIMEOUT_MS", defaults.handshake_timeout),
            transport_timeout: millis("PEERLINK_TRANSPORT_TIMEOUT_MS", defaults.transport_timeout),
            backoff_base: millis("PEERLINK_BACKOFF_BASE_MS", defaults.backoff_base),
            backoff_max: millis("PEERLINK_BACKOFF_MAX_MS", defaults.backoff_max),
            max_reconnect_attempts: env_u64(
                "PEERLINK_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts as u64,
            )
            .min(u32::MAX as u64) as u32,
            health_checks: env_bool("PEERLINK_HEALTH_CHECKS", defaults.health_checks),
            health_interval: millis("PEERLINK_HEALTH_INTERVAL_MS", defaults.health_interval),
            replay_window: Duration::from_secs(env_u64(
                "PEERLINK_REPLAY_WINDOW_SECS",
                defaults.replay_window.as_secs(),
            )),
            max_buffered_bytes: env_u64(
                "PEERLINK_MAX_BUFFERED_BYTES",
                defaults.max_buffered_bytes as u64,
            ) as usize,
            ..defaults
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let non_zero = [
            ("handshake_timeout", self.handshake_timeout),
            ("transport_timeout", self.transport_timeout),
            ("backoff_base", self.backoff_base),
            ("health_interval", self.health_interval),
            ("replay_window", self.replay_window),
            ("crypto_failure_window", self.crypto_failure_window),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }
        if self.backoff_max < self.backoff_base {
            return Err(Error::config(format!(
                "backoff_max ({:?}) is below backoff_base ({:?})",
                self.backoff_max, self.backoff_base
            )));
        }
        if self.max_buffered_bytes == 0 {
            return Err(Error::config("max_buffered_bytes must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.loss_degraded) {
            return Err(Error::config("loss_degraded must be within 0.0..=1.0"));
        }
        Ok(())
    }
}
