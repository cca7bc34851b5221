//! Ed25519 identity keys and peer ids.
//!
//! A **peer id** is the base64url-encoded Ed25519 public key (32 bytes → 43
//! characters). It is what logs and the application use to refer to a peer;
//! the raw key is what crosses the wire.
//!
//! # Example
//!
//! ```
//! use peerlink_crypto::identity::IdentityKeypair;
//!
//! let keypair = IdentityKeypair::from_bytes(&[7u8; 32]);
//! let signature = keypair.sign(b"challenge");
//! assert!(keypair.verify(b"challenge", &signature));
//! assert_eq!(keypair.peer_id().as_str().len(), 43);
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::keys::KEY_LEN;

/// Peer id: base64url-encoded Ed25519 public key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id from raw public key bytes.
    pub fn from_public_key(bytes: &[u8; KEY_LEN]) -> Self {
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Parse a peer id from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(s).ok()?;
        (bytes.len() == KEY_LEN).then(|| Self(s.to_string()))
    }

    /// Get the raw public key bytes.
    pub fn to_bytes(&self) -> Option<[u8; KEY_LEN]> {
        URL_SAFE_NO_PAD.decode(&self.0).ok()?.try_into().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Ed25519 identity keypair.
///
/// The signing key is zeroized on drop by `ed25519-dalek`.
pub struct IdentityKeypair {
    signing_key: SigningKey,
}

impl IdentityKeypair {
    /// Create from raw signing key bytes (as stored by the identity store).
    pub fn from_bytes(bytes: &[u8; KEY_LEN]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(self.signing_key.verifying_key().as_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; KEY_LEN] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// Get the private key bytes.
    ///
    /// # Security
    /// Only for handing back to the identity store. Never send these.
    pub fn private_key_bytes(&self) -> [u8; KEY_LEN] {
        self.signing_key.to_bytes()
    }

    /// Deterministic Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature against this identity's public key.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        let sig = Signature::from_bytes(signature);
        self.signing_key
            .verifying_key()
            .verify(message, &sig)
            .is_ok()
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKeypair({})", self.peer_id())
    }
}

/// The local identity as handed out by the identity store.
#[derive(Debug)]
pub struct LocalIdentity {
    pub keypair: IdentityKeypair,
    /// Human-readable label shown to the peer.
    pub label: String,
    /// Stable per-install device identifier.
    pub device_id: String,
}

impl LocalIdentity {
    pub fn new(keypair: IdentityKeypair, label: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            keypair,
            label: label.into(),
            device_id: device_id.into(),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; KEY_LEN] {
        self.keypair.public_key_bytes()
    }
}

/// Trust annotation attached to a verified peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Never successfully authenticated before.
    Unknown,
    Low,
    Medium,
    High,
}

/// Remote identity, only constructed after its signature verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub public_key: [u8; KEY_LEN],
    pub label: String,
    pub device_id: String,
    pub trust: TrustLevel,
}

impl PeerIdentity {
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }

    /// Short fingerprint for out-of-band comparison: first 8 bytes of
    /// SHA-256(public key) as grouped hex.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }
}

/// `xxxx-xxxx-xxxx-xxxx` fingerprint of a public key.
pub fn fingerprint(public_key: &[u8; KEY_LEN]) -> String {
    let digest = Sha256::digest(public_key);
    digest[..8]
        .chunks(2)
        .map(hex::encode)
        .collect::<Vec<_>>()
        .join("-")
}

/// Verify `signature` over `message` for an arbitrary public key.
///
/// Never errors: malformed keys or signatures simply fail verification.
/// Uses strict verification, rejecting small-order keys and non-canonical
/// signatures.
pub fn verify_signature(public_key: &[u8; KEY_LEN], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_strict(message, &sig).is_ok()
}
