use std::time::Duration;

/// Capped exponential reconnect backoff.
///
/// Attempt `n` (0-based) waits `min(base * 2^n, max)`. After `cap` attempts
/// [`next_delay`](Self::next_delay) returns `None` until reset.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    cap: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, cap: u32) -> Self {
        Self {
            base,
            max,
            cap,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.cap {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt += 1;
        Some(delay)
    }

    /// Attempts consumed since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
