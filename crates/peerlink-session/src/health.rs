//! Link health: ping bookkeeping, smoothed RTT and loss.

use std::collections::VecDeque;

/// Pings remembered for the loss estimate.
const LOSS_WINDOW: usize = 10;

/// Snapshot reported with quality changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkQuality {
    pub rtt_ms: Option<u64>,
    pub loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub id: u64,
    pub sent_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    SendPing(Ping),
    /// Too many consecutive pings went unanswered.
    Unresponsive { missed: u32 },
}

#[derive(Debug)]
pub struct HealthMonitor {
    rtt_degraded_ms: u64,
    loss_degraded: f64,
    max_missed: u32,
    smooth_rtt_ms: Option<f64>,
    outstanding: Option<Ping>,
    next_id: u64,
    answered: VecDeque<bool>,
    consecutive_missed: u32,
    degraded: bool,
}

impl HealthMonitor {
    pub fn new(rtt_degraded_ms: u64, loss_degraded: f64, max_missed: u32) -> Self {
        Self {
            rtt_degraded_ms,
            loss_degraded,
            max_missed,
            smooth_rtt_ms: None,
            outstanding: None,
            next_id: 0,
            answered: VecDeque::with_capacity(LOSS_WINDOW),
            consecutive_missed: 0,
            degraded: false,
        }
    }

    /// Called once per health interval.
    pub fn on_tick(&mut self, now_ms: u64) -> TickOutcome {
        if self.outstanding.take().is_some() {
            self.consecutive_missed += 1;
            self.record(false);
            if self.consecutive_missed >= self.max_missed {
                return TickOutcome::Unresponsive {
                    missed: self.consecutive_missed,
                };
            }
        }

        let ping = Ping {
            id: self.next_id,
            sent_ms: now_ms,
        };
        self.next_id += 1;
        self.outstanding = Some(ping);
        TickOutcome::SendPing(ping)
    }

    /// Returns the measured RTT when `id` answers the outstanding ping.
    pub fn on_pong(&mut self, id: u64, now_ms: u64) -> Option<u64> {
        let ping = self.outstanding.filter(|p| p.id == id)?;
        self.outstanding = None;
        self.consecutive_missed = 0;
        self.record(true);

        let rtt = now_ms.saturating_sub(ping.sent_ms);
        self.smooth_rtt_ms = Some(match self.smooth_rtt_ms {
            None => rtt as f64,
            Some(smooth) => 0.875 * smooth + 0.125 * rtt as f64,
        });
        Some(rtt)
    }

    pub fn quality(&self) -> LinkQuality {
        LinkQuality {
            rtt_ms: self.smooth_rtt_ms.map(|rtt| rtt.round() as u64),
            loss: self.loss(),
        }
    }

    /// `Some(degraded)` when the link crossed a threshold since the last call.
    pub fn evaluate(&mut self) -> Option<bool> {
        let rtt_bad = self
            .smooth_rtt_ms
            .is_some_and(|rtt| rtt > self.rtt_degraded_ms as f64);
        let degraded = rtt_bad || self.loss() > self.loss_degraded;
        if degraded == self.degraded {
            return None;
        }
        self.degraded = degraded;
        Some(degraded)
    }

    fn loss(&self) -> f64 {
        if self.answered.is_empty() {
            return 0.0;
        }
        let lost = self.answered.iter().filter(|ok| !**ok).count();
        lost as f64 / self.answered.len() as f64
    }

    fn record(&mut self, answered: bool) {
        if self.answered.len() == LOSS_WINDOW {
            self.answered.pop_front();
        }
        self.answered.push_back(answered);
    }
}
