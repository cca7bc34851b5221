//! Identity and trust storage contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use peerlink_crypto::{LocalIdentity, TrustLevel};

/// Backing store for the local identity and per-peer trust.
///
/// Persistence is up to the implementation; the session only calls these
/// from its own task.
pub trait TrustStore: Send + Sync {
    fn local_identity(&self) -> Arc<LocalIdentity>;

    fn lookup_trust(&self, public_key: &[u8; 32]) -> TrustLevel;

    /// Record a verified handshake and return the peer's resulting trust.
    fn record_successful_auth(&self, public_key: &[u8; 32]) -> TrustLevel;
}

/// Successful authentications needed for each level.
const MEDIUM_AFTER: u32 = 5;
const HIGH_AFTER: u32 = 20;

fn level_for(successes: u32) -> TrustLevel {
    match successes {
        0 => TrustLevel::Unknown,
        n if n >= HIGH_AFTER => TrustLevel::High,
        n if n >= MEDIUM_AFTER => TrustLevel::Medium,
        _ => TrustLevel::Low,
    }
}

/// Non-persistent store, suitable for tests and short-lived processes.
#[derive(Debug)]
pub struct MemoryTrustStore {
    identity: Arc<LocalIdentity>,
    successes: Mutex<HashMap<[u8; 32], u32>>,
}

impl MemoryTrustStore {
    pub fn new(identity: LocalIdentity) -> Self {
        Self {
            identity: Arc::new(identity),
            successes: Mutex::new(HashMap::new()),
        }
    }
}

impl TrustStore for MemoryTrustStore {
    fn local_identity(&self) -> Arc<LocalIdentity> {
        self.identity.clone()
    }

    fn lookup_trust(&self, public_key: &[u8; 32]) -> TrustLevel {
        let successes = self.successes.lock().unwrap_or_else(PoisonError::into_inner);
        level_for(successes.get(public_key).copied().unwrap_or(0))
    }

    fn record_successful_auth(&self, public_key: &[u8; 32]) -> TrustLevel {
        let mut successes = self.successes.lock().unwrap_or_else(PoisonError::into_inner);
        let count = successes.entry(*public_key).or_insert(0);
        *count = count.saturating_add(1);
        level_for(*count)
    }
}
