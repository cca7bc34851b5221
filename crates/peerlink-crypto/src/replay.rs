//! Replay protection for received messages.
//!
//! Two independent checks:
//! - the sender timestamp must be within `max_skew` of our clock, which bounds
//!   how long a captured message stays replayable at all;
//! - the nonce counter must be new, tracked with a 128-entry sliding bitmap so
//!   mild reordering by the transport is tolerated.
//!
//! Checking and committing are separate steps. The codec only commits a
//! counter after the AEAD tag verified, so forged packets cannot advance the
//! window.

use thiserror::Error;

/// Number of counters tracked below the highest one seen.
pub const COUNTER_WINDOW: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplayRejection {
    #[error("timestamp outside window (skew {skew_ms} ms)")]
    ClockSkew { skew_ms: u64 },

    #[error("duplicate counter {0}")]
    Duplicate(u64),

    #[error("counter {0} is older than the window")]
    TooOld(u64),
}

#[derive(Debug, Clone)]
pub struct ReplayGuard {
    max_skew_ms: u64,
    highest: Option<u64>,
    /// Bit `n` set means counter `highest - n` was accepted.
    bitmap: u128,
}

impl ReplayGuard {
    pub fn new(max_skew_ms: u64) -> Self {
        Self {
            max_skew_ms,
            highest: None,
            bitmap: 0,
        }
    }

    pub fn check_timestamp(&self, ts: u64, now_ms: u64) -> Result<(), ReplayRejection> {
        let skew_ms = now_ms.abs_diff(ts);
        if skew_ms > self.max_skew_ms {
            return Err(ReplayRejection::ClockSkew { skew_ms });
        }
        Ok(())
    }

    /// Does not modify state.
    pub fn check_counter(&self, counter: u64) -> Result<(), ReplayRejection> {
        let Some(highest) = self.highest else {
            return Ok(());
        };
        if counter > highest {
            return Ok(());
        }
        let offset = highest - counter;
        if offset >= COUNTER_WINDOW {
            return Err(ReplayRejection::TooOld(counter));
        }
        if self.bitmap & (1u128 << offset) != 0 {
            return Err(ReplayRejection::Duplicate(counter));
        }
        Ok(())
    }

    /// Mark `counter` as seen. Call only after [`check_counter`](Self::check_counter)
    /// passed and the message authenticated.
    pub fn commit(&mut self, counter: u64) {
        match self.highest {
            None => {
                self.highest = Some(counter);
                self.bitmap = 1;
            }
            Some(highest) if counter > highest => {
                let shift = counter - highest;
                self.bitmap = if shift >= COUNTER_WINDOW {
                    1
                } else {
                    (self.bitmap << shift) | 1
                };
                self.highest = Some(counter);
            }
            Some(highest) => {
                let offset = highest - counter;
                if offset < COUNTER_WINDOW {
                    self.bitmap |= 1u128 << offset;
                }
            }
        }
    }

    /// Timestamp check, counter check and commit in one step.
    pub fn accept(&mut self, counter: u64, ts: u64, now_ms: u64) -> Result<(), ReplayRejection> {
        self.check_timestamp(ts, now_ms)?;
        self.check_counter(counter)?;
        self.commit(counter);
        Ok(())
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }
}
