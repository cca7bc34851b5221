//! Wire records exchanged inside the transport channel.
//!
//! Every transport payload is one bincode-encoded [`Frame`]. Decoding is
//! bounded so a hostile peer cannot make us allocate more than
//! [`MAX_FRAME_BYTES`].

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{NONCE_LEN, SIGNATURE_LEN};
use crate::keys::KEY_LEN;

/// Largest encoded frame accepted on decode.
pub const MAX_FRAME_BYTES: u64 = 4 * 1024 * 1024;

/// Upper bound on the bytes sealing and framing add to a plaintext: AEAD
/// tag, nonce, timestamp, sender id and bincode tags and length prefixes.
pub const DATA_FRAME_OVERHEAD: usize = 96;

pub const MIN_CHALLENGE_LEN: usize = 16;
pub const MAX_CHALLENGE_LEN: usize = 64;
pub const MAX_LABEL_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("invalid field: {0}")]
    Invalid(&'static str),
}

/// Which half of the handshake an [`AuthMessage`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthKind {
    Challenge,
    Response,
}

impl AuthKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            AuthKind::Challenge => 1,
            AuthKind::Response => 2,
        }
    }
}

/// `AuthChallenge` / `AuthResponse`; both share one shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMessage {
    pub kind: AuthKind,
    pub identity_public_key: [u8; KEY_LEN],
    pub ephemeral_public_key: [u8; KEY_LEN],
    pub challenge: Vec<u8>,
    pub signature: Vec<u8>,
    pub label: String,
    pub device_id: String,
    /// Sender wall clock, ms since the Unix epoch.
    pub ts: u64,
}

impl AuthMessage {
    /// Structural checks only; the signature is verified by the handshake.
    pub fn validate(&self) -> Result<(), WireError> {
        if !(MIN_CHALLENGE_LEN..=MAX_CHALLENGE_LEN).contains(&self.challenge.len()) {
            return Err(WireError::Invalid("challenge length"));
        }
        if self.signature.len() != SIGNATURE_LEN {
            return Err(WireError::Invalid("signature length"));
        }
        if self.label.len() > MAX_LABEL_LEN {
            return Err(WireError::Invalid("label length"));
        }
        if self.device_id.len() > MAX_LABEL_LEN {
            return Err(WireError::Invalid("device id length"));
        }
        Ok(())
    }
}

/// One sealed application-level message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub ts: u64,
    pub sender_id: [u8; KEY_LEN],
}

impl std::fmt::Debug for EncryptedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedMessage")
            .field("nonce", &hex::encode(self.nonce))
            .field("ciphertext_len", &self.ciphertext.len())
            .field("ts", &self.ts)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Auth(AuthMessage),
    Data(EncryptedMessage),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_BYTES)
        .reject_trailing_bytes()
}

impl Frame {
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
