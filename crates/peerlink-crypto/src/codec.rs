//! AEAD codec for one established session.
//!
//! Nonces are `[0, 0, 0, 0] || counter_le`, with one counter per direction
//! (each direction also has its own key, so the two counters never collide).
//! The associated data is `ts_be || sender_id`, binding the sender's clock
//! and identity to every ciphertext.

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::engine::{CryptoEngine, CryptoError, NONCE_LEN};
use crate::identity::PeerId;
use crate::keys::{SessionKeys, KEY_LEN};
use crate::replay::{ReplayGuard, ReplayRejection};
use crate::wire::{EncryptedMessage, MAX_FRAME_BYTES};

/// Largest plaintext accepted by [`SessionCodec::seal`]. Leaves room for the
/// tag and the frame envelope under the decoder's limit.
pub const MAX_PLAINTEXT_LEN: usize = MAX_FRAME_BYTES as usize - 1024;

const COUNTER_OFFSET: usize = NONCE_LEN - 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message from unexpected sender")]
    UnknownSender,

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("message authentication failed")]
    AuthenticationFailed,

    #[error("replay or clock skew: {0}")]
    ReplayOrClockSkew(ReplayRejection),

    #[error("send counter exhausted")]
    NonceExhausted,

    #[error("plaintext of {len} bytes exceeds {max}")]
    TooLarge { len: usize, max: usize },

    #[error("crypto: {0}")]
    Crypto(CryptoError),
}

impl From<CryptoError> for CodecError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => CodecError::AuthenticationFailed,
            other => CodecError::Crypto(other),
        }
    }
}

impl From<ReplayRejection> for CodecError {
    fn from(err: ReplayRejection) -> Self {
        CodecError::ReplayOrClockSkew(err)
    }
}

/// Seals outgoing and opens incoming messages for one verified peer.
///
/// Owns the session keys; they are zeroized when the codec is dropped.
pub struct SessionCodec {
    engine: Arc<dyn CryptoEngine>,
    keys: SessionKeys,
    local_id: [u8; KEY_LEN],
    peer_id: [u8; KEY_LEN],
    send_counter: u64,
    replay: ReplayGuard,
}

impl SessionCodec {
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        keys: SessionKeys,
        local_id: [u8; KEY_LEN],
        peer_id: [u8; KEY_LEN],
        replay_window_ms: u64,
    ) -> Self {
        Self {
            engine,
            keys,
            local_id,
            peer_id,
            send_counter: 0,
            replay: ReplayGuard::new(replay_window_ms),
        }
    }

    pub fn peer_public_key(&self) -> &[u8; KEY_LEN] {
        &self.peer_id
    }

    pub fn seal(&mut self, plaintext: &[u8], now_ms: u64) -> Result<EncryptedMessage, CodecError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CodecError::TooLarge {
                len: plaintext.len(),
                max: MAX_PLAINTEXT_LEN,
            });
        }
        if self.send_counter == u64::MAX {
            return Err(CodecError::NonceExhausted);
        }
        let counter = self.send_counter;
        self.send_counter += 1;

        let nonce = counter_to_nonce(counter);
        let ad = associated_data(now_ms, &self.local_id);
        let (send_key, _) = self.keys.directional(&self.local_id, &self.peer_id);
        let ciphertext = self.engine.seal(send_key, &nonce, plaintext, &ad)?;

        Ok(EncryptedMessage {
            nonce,
            ciphertext,
            ts: now_ms,
            sender_id: self.local_id,
        })
    }

    /// Authenticate and decrypt. Replay state only advances on success.
    pub fn open(&mut self, msg: &EncryptedMessage, now_ms: u64) -> Result<Vec<u8>, CodecError> {
        if msg.sender_id != self.peer_id {
            return Err(CodecError::UnknownSender);
        }
        let counter = nonce_to_counter(&msg.nonce).ok_or(CodecError::Malformed("nonce prefix"))?;

        let ad = associated_data(msg.ts, &msg.sender_id);
        let (_, recv_key) = self.keys.directional(&self.local_id, &self.peer_id);
        let plaintext = self.engine.open(recv_key, &msg.nonce, &msg.ciphertext, &ad)?;

        self.replay.check_timestamp(msg.ts, now_ms)?;
        self.replay.check_counter(counter)?;
        self.replay.commit(counter);

        trace!(
            peer = %PeerId::from_public_key(&self.peer_id),
            counter,
            len = plaintext.len(),
            "message opened"
        );
        Ok(plaintext)
    }
}

impl std::fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCodec")
            .field("peer", &PeerId::from_public_key(&self.peer_id))
            .field("send_counter", &self.send_counter)
            .field("recv_highest", &self.replay.highest())
            .finish_non_exhaustive()
    }
}

fn counter_to_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[COUNTER_OFFSET..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn nonce_to_counter(nonce: &[u8; NONCE_LEN]) -> Option<u64> {
    if nonce[..COUNTER_OFFSET] != [0u8; COUNTER_OFFSET] {
        return None;
    }
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&nonce[COUNTER_OFFSET..]);
    Some(u64::from_le_bytes(counter))
}

fn associated_data(ts: u64, sender_id: &[u8; KEY_LEN]) -> [u8; 8 + KEY_LEN] {
    let mut ad = [0u8; 8 + KEY_LEN];
    ad[..8].copy_from_slice(&ts.to_be_bytes());
    ad[8..].copy_from_slice(sender_id);
    ad
}
