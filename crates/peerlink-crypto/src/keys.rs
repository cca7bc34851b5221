//! Ephemeral and symmetric key material.
//!
//! None of these types implement `Clone`: an ephemeral pair is consumed by key
//! agreement, and session keys are owned by exactly one session. All secret
//! bytes are zeroized on drop.

use std::fmt;

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of X25519 and Ed25519 public keys and of each AEAD key.
pub const KEY_LEN: usize = 32;

/// Single-use X25519 key-agreement pair.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: [u8; KEY_LEN],
}

impl EphemeralKeypair {
    pub(crate) fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// Public half, sent to the peer.
    pub fn public_bytes(&self) -> [u8; KEY_LEN] {
        self.public
    }

    /// Run X25519 against the peer's public key, consuming the secret.
    pub(crate) fn diffie_hellman(self, remote_public: &[u8; KEY_LEN]) -> x25519_dalek::SharedSecret {
        self.secret.diffie_hellman(&PublicKey::from(*remote_public))
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Raw X25519 output.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    pub(crate) fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Directional AEAD keys for one transport session.
///
/// Both peers derive byte-identical values. The two keys are labelled by the
/// ordering of the peers' identity public keys, so each side can pick its
/// send and receive key without knowing who initiated.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    low_to_high: [u8; KEY_LEN],
    high_to_low: [u8; KEY_LEN],
}

impl SessionKeys {
    /// Length of the key-derivation output consumed by [`SessionKeys::from_okm`].
    pub const OKM_LEN: usize = 2 * KEY_LEN;

    pub(crate) fn from_okm(okm: &[u8; Self::OKM_LEN]) -> Self {
        let mut low_to_high = [0u8; KEY_LEN];
        let mut high_to_low = [0u8; KEY_LEN];
        low_to_high.copy_from_slice(&okm[..KEY_LEN]);
        high_to_low.copy_from_slice(&okm[KEY_LEN..]);
        Self {
            low_to_high,
            high_to_low,
        }
    }

    /// Returns `(send_key, recv_key)` for the side owning `local_identity`.
    pub fn directional(
        &self,
        local_identity: &[u8; KEY_LEN],
        remote_identity: &[u8; KEY_LEN],
    ) -> (&[u8; KEY_LEN], &[u8; KEY_LEN]) {
        if local_identity < remote_identity {
            (&self.low_to_high, &self.high_to_low)
        } else {
            (&self.high_to_low, &self.low_to_high)
        }
    }
}

impl PartialEq for SessionKeys {
    fn eq(&self, other: &Self) -> bool {
        let mut diff = 0u8;
        for (a, b) in self
            .low_to_high
            .iter()
            .chain(self.high_to_low.iter())
            .zip(other.low_to_high.iter().chain(other.high_to_low.iter()))
        {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl Eq for SessionKeys {}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}
