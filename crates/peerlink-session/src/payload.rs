//! Plaintext carried inside every sealed session message.

use bincode::Options;
use peerlink_crypto::WireError;
use serde::{Deserialize, Serialize};

const MAX_PAYLOAD_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    App(Vec<u8>),
    Ping { id: u64, sent_ms: u64 },
    Pong { id: u64, sent_ms: u64 },
    /// The sender is leaving; treat as channel closed.
    Close,
    /// First message after key agreement; opening it confirms the keys.
    Confirm,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PAYLOAD_BYTES)
        .reject_trailing_bytes()
}

impl Payload {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        options()
            .serialize(self)
            .map_err(|e| WireError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        options()
            .deserialize(bytes)
            .map_err(|e| WireError::Decode(e.to_string()))
    }
}
