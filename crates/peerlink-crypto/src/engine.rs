//! Cryptographic primitives behind a single injectable engine.
//!
//! The handshake and codec only talk to `dyn CryptoEngine`. The build selects
//! one backend ([`DalekEngine`]); there is no runtime probing or fallback to
//! a weaker construction.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::identity::{verify_signature, IdentityKeypair};
use crate::keys::{EphemeralKeypair, SessionKeys, SharedSecret, KEY_LEN};

/// AEAD nonce length (96 bits).
pub const NONCE_LEN: usize = 12;

/// Ed25519 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Crypto engine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("entropy source unavailable: {0}")]
    Entropy(String),

    #[error("invalid peer key")]
    InvalidPeerKey,

    #[error("AEAD authentication failed")]
    AuthenticationFailed,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed")]
    Encryption,
}

/// Every primitive the protocol needs.
///
/// Implementations must be free of I/O other than entropy consumption.
pub trait CryptoEngine: Send + Sync {
    /// Fill `buf` from the CSPRNG.
    fn fill_random(&self, buf: &mut [u8]) -> Result<(), CryptoError>;

    /// Fresh long-term Ed25519 identity.
    fn generate_identity_keypair(&self) -> Result<IdentityKeypair, CryptoError>;

    /// Fresh X25519 pair; every call draws new randomness.
    fn generate_ephemeral_keypair(&self) -> Result<EphemeralKeypair, CryptoError>;

    /// X25519 agreement. Consumes the ephemeral pair so it cannot be reused.
    ///
    /// Fails with [`CryptoError::InvalidPeerKey`] when the remote key is a
    /// low-order point (the output would not depend on our secret).
    fn agree(
        &self,
        local: EphemeralKeypair,
        remote_public: &[u8; KEY_LEN],
    ) -> Result<SharedSecret, CryptoError>;

    /// HKDF extract-and-expand over the shared secret. Deterministic.
    fn derive_session_keys(
        &self,
        shared: &SharedSecret,
        salt: &[u8],
        context: &[u8],
    ) -> Result<SessionKeys, CryptoError>;

    fn seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Fails with [`CryptoError::AuthenticationFailed`] on any tag mismatch.
    fn open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn sign(&self, identity: &IdentityKeypair, message: &[u8]) -> [u8; SIGNATURE_LEN];

    /// Never errors; malformed input just fails verification.
    fn verify(&self, public_key: &[u8; KEY_LEN], message: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 / X25519 / HKDF-SHA-256 / ChaCha20-Poly1305 backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct DalekEngine;

impl DalekEngine {
    pub fn new() -> Self {
        Self
    }

    fn seed(&self) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
        let mut seed = Zeroizing::new([0u8; KEY_LEN]);
        self.fill_random(seed.as_mut())?;
        Ok(seed)
    }
}

impl CryptoEngine for DalekEngine {
    fn fill_random(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| CryptoError::Entropy(e.to_string()))
    }

    fn generate_identity_keypair(&self) -> Result<IdentityKeypair, CryptoError> {
        let seed = self.seed()?;
        Ok(IdentityKeypair::from_bytes(&seed))
    }

    fn generate_ephemeral_keypair(&self) -> Result<EphemeralKeypair, CryptoError> {
        let seed = self.seed()?;
        Ok(EphemeralKeypair::from_secret_bytes(*seed))
    }

    fn agree(
        &self,
        local: EphemeralKeypair,
        remote_public: &[u8; KEY_LEN],
    ) -> Result<SharedSecret, CryptoError> {
        let shared = local.diffie_hellman(remote_public);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPeerKey);
        }
        Ok(SharedSecret::new(*shared.as_bytes()))
    }

    fn derive_session_keys(
        &self,
        shared: &SharedSecret,
        salt: &[u8],
        context: &[u8],
    ) -> Result<SessionKeys, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
        let mut okm = Zeroizing::new([0u8; SessionKeys::OKM_LEN]);
        hkdf.expand(context, okm.as_mut())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(SessionKeys::from_okm(&okm))
    }

    fn seal(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(key.into());
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::Encryption)
    }

    fn open(
        &self,
        key: &[u8; KEY_LEN],
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        // Tag comparison inside chacha20poly1305 is constant time.
        let cipher = ChaCha20Poly1305::new(key.into());
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    fn sign(&self, identity: &IdentityKeypair, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        identity.sign(message)
    }

    fn verify(&self, public_key: &[u8; KEY_LEN], message: &[u8], signature: &[u8]) -> bool {
        verify_signature(public_key, message, signature)
    }
}
