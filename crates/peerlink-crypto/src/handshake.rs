//! Mutual authentication and session key agreement.
//!
//! A sans-IO state machine: the caller feeds it received [`AuthMessage`]s and
//! sends whatever it hands back. One `Handshake` value covers exactly one
//! connection attempt and owns that attempt's ephemeral key pair.
//!
//! ```text
//! initiator                              responder
//!   Idle --initiate()--> ChallengeSent
//!             AuthChallenge ------------>  Idle
//!                                          verify, agree, derive
//!             <------------ AuthResponse   ResponseReceived
//!   verify, agree, derive
//!   Verified
//!             first sealed message ----->  confirm()
//!                                          Verified
//! ```
//!
//! A signed challenge alone proves nothing about liveness: it can be
//! replayed for as long as its timestamp is inside the skew window. The
//! initiator is confirmed by a response that answers its own fresh
//! challenge. The responder is only confirmed once a message sealed under
//! the derived keys arrives, which the caller reports with
//! [`Handshake::confirm`]. Until then the keys in [`Established`] may only be
//! used to open that message.
//!
//! Each message is signed by the sender's identity key over
//! `"peerlink-auth-v1" || kind || challenge || ephemeral_public_key || ts`,
//! and a response additionally over the challenge it answers. Session keys
//! are `HKDF(shared, salt = challenge_initiator || challenge_responder,
//! info = "session-v1")`.
//!
//! If both sides initiate at once (glare), each receives a challenge while in
//! `ChallengeSent`. Both challenges are then known to both sides, so the side
//! with the lower identity key is treated as the initiator for salt ordering
//! and no extra round trip is needed.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::{CryptoEngine, CryptoError};
use crate::identity::{LocalIdentity, PeerId, PeerIdentity, TrustLevel};
use crate::keys::{EphemeralKeypair, SessionKeys, KEY_LEN};
use crate::wire::{AuthKind, AuthMessage};

/// Length of the challenges we generate.
pub const CHALLENGE_LEN: usize = 32;

/// HKDF info string for session keys.
pub const SESSION_CONTEXT: &[u8] = b"session-v1";

const TRANSCRIPT_DOMAIN: &[u8] = b"peerlink-auth-v1";

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Total time allowed for one attempt.
    pub timeout: Duration,
    /// Largest accepted difference between a message `ts` and our clock.
    pub max_clock_skew: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_clock_skew: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    ChallengeSent,
    ResponseReceived,
    Verified,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("peer signature invalid")]
    SignatureInvalid,

    #[error("handshake timed out")]
    Timeout,

    #[error("invalid peer key")]
    InvalidPeerKey,

    #[error("malformed handshake message: {0}")]
    Malformed(String),

    #[error("handshake message timestamp skewed by {skew_ms} ms")]
    ClockSkew { skew_ms: u64 },

    #[error("unexpected {kind:?} in state {state:?}")]
    UnexpectedMessage {
        kind: AuthKind,
        state: HandshakeState,
    },

    #[error("operation not valid in state {state:?}")]
    InvalidState { state: HandshakeState },

    #[error("handshake already finished")]
    Finished,

    #[error("crypto: {0}")]
    Crypto(CryptoError),
}

impl From<CryptoError> for HandshakeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidPeerKey => HandshakeError::InvalidPeerKey,
            other => HandshakeError::Crypto(other),
        }
    }
}

/// Result of a verified handshake.
#[derive(Debug)]
pub struct Established {
    /// Trust is always [`TrustLevel::Unknown`] here; the caller annotates it.
    pub peer: PeerIdentity,
    pub keys: SessionKeys,
    /// Response to transmit, when we were the responder.
    pub reply: Option<AuthMessage>,
    /// The peer answered our own challenge. When false the peer is tentative
    /// until [`Handshake::confirm`].
    pub confirmed: bool,
}

pub struct Handshake {
    engine: Arc<dyn CryptoEngine>,
    identity: Arc<LocalIdentity>,
    config: HandshakeConfig,
    state: HandshakeState,
    failure: Option<HandshakeError>,
    ephemeral: Option<EphemeralKeypair>,
    ephemeral_public: [u8; KEY_LEN],
    challenge: Vec<u8>,
    initiator: bool,
    deadline: Instant,
}

impl Handshake {
    /// Start a new attempt with a fresh ephemeral pair and challenge.
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        identity: Arc<LocalIdentity>,
        config: HandshakeConfig,
        now: Instant,
    ) -> Result<Self, HandshakeError> {
        let ephemeral = engine.generate_ephemeral_keypair()?;
        let mut challenge = vec![0u8; CHALLENGE_LEN];
        engine.fill_random(&mut challenge)?;

        let deadline = now + config.timeout;
        Ok(Self {
            engine,
            identity,
            config,
            state: HandshakeState::Idle,
            failure: None,
            ephemeral_public: ephemeral.public_bytes(),
            ephemeral: Some(ephemeral),
            challenge,
            initiator: false,
            deadline,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Why the attempt failed, once in [`HandshakeState::Failed`].
    pub fn failure(&self) -> Option<&HandshakeError> {
        self.failure.as_ref()
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Build the `AuthChallenge` and move to `ChallengeSent`.
    pub fn initiate(&mut self, now_ms: u64) -> Result<AuthMessage, HandshakeError> {
        if self.state != HandshakeState::Idle {
            return Err(HandshakeError::InvalidState { state: self.state });
        }
        let msg = self.build(AuthKind::Challenge, now_ms, None);
        self.initiator = true;
        self.state = HandshakeState::ChallengeSent;
        debug!("auth challenge prepared");
        Ok(msg)
    }

    /// Process a message from the peer.
    ///
    /// Any error other than `Finished` is terminal: the state moves to
    /// `Failed` and the ephemeral secret is dropped.
    pub fn handle(&mut self, msg: &AuthMessage, now_ms: u64) -> Result<Established, HandshakeError> {
        if matches!(
            self.state,
            HandshakeState::ResponseReceived | HandshakeState::Verified | HandshakeState::Failed
        ) {
            return Err(HandshakeError::Finished);
        }
        let result = self.process(msg, now_ms);
        if let Err(err) = &result {
            self.fail(err.clone());
        }
        result
    }

    /// Mark a tentative peer as confirmed after a message sealed under the
    /// derived keys opened successfully.
    pub fn confirm(&mut self) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::ResponseReceived {
            return Err(HandshakeError::InvalidState { state: self.state });
        }
        self.state = HandshakeState::Verified;
        debug!("peer confirmed session keys");
        Ok(())
    }

    /// Fail with `Timeout` if the deadline passed. Returns whether it fired.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if now >= self.deadline && !self.is_finished() {
            self.expire();
            return true;
        }
        false
    }

    /// Abandon the attempt as timed out.
    pub fn expire(&mut self) {
        if !self.is_finished() {
            self.fail(HandshakeError::Timeout);
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, HandshakeState::Verified | HandshakeState::Failed)
    }

    fn fail(&mut self, err: HandshakeError) {
        warn!("handshake failed: {}", err);
        self.ephemeral = None;
        self.state = HandshakeState::Failed;
        self.failure = Some(err);
    }

    fn process(&mut self, msg: &AuthMessage, now_ms: u64) -> Result<Established, HandshakeError> {
        msg.validate()
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;

        let expected = match (self.state, msg.kind) {
            (HandshakeState::Idle, AuthKind::Challenge)
            | (HandshakeState::ChallengeSent, AuthKind::Challenge)
            | (HandshakeState::ChallengeSent, AuthKind::Response) => true,
            _ => false,
        };
        if !expected {
            return Err(HandshakeError::UnexpectedMessage {
                kind: msg.kind,
                state: self.state,
            });
        }

        let skew_ms = now_ms.abs_diff(msg.ts);
        if skew_ms > self.config.max_clock_skew.as_millis() as u64 {
            return Err(HandshakeError::ClockSkew { skew_ms });
        }

        let local_key = self.identity.public_key_bytes();
        if msg.identity_public_key == local_key {
            return Err(HandshakeError::InvalidPeerKey);
        }

        let answered = (msg.kind == AuthKind::Response).then_some(self.challenge.as_slice());
        let signed = transcript(
            msg.kind,
            &msg.challenge,
            &msg.ephemeral_public_key,
            msg.ts,
            answered,
        );
        if !self
            .engine
            .verify(&msg.identity_public_key, &signed, &msg.signature)
        {
            return Err(HandshakeError::SignatureInvalid);
        }

        let peer_id = PeerId::from_public_key(&msg.identity_public_key);
        let (salt, reply) = match (self.state, msg.kind) {
            (HandshakeState::Idle, _) => {
                debug!(peer = %peer_id, "answering auth challenge");
                let reply = self.build(AuthKind::Response, now_ms, Some(&msg.challenge));
                (concat(&msg.challenge, &self.challenge), Some(reply))
            }
            (_, AuthKind::Response) => (concat(&self.challenge, &msg.challenge), None),
            (_, AuthKind::Challenge) => {
                self.initiator = local_key < msg.identity_public_key;
                debug!(peer = %peer_id, initiator = self.initiator, "simultaneous auth challenge");
                if self.initiator {
                    (concat(&self.challenge, &msg.challenge), None)
                } else {
                    (concat(&msg.challenge, &self.challenge), None)
                }
            }
        };
        self.state = HandshakeState::ResponseReceived;

        let ephemeral = self
            .ephemeral
            .take()
            .ok_or(HandshakeError::InvalidState { state: self.state })?;
        let shared = self.engine.agree(ephemeral, &msg.ephemeral_public_key)?;
        let keys = self
            .engine
            .derive_session_keys(&shared, &salt, SESSION_CONTEXT)?;

        // Only a response to our own challenge proves the peer is live.
        let confirmed = msg.kind == AuthKind::Response;
        if confirmed {
            self.state = HandshakeState::Verified;
            debug!(peer = %peer_id, "handshake verified");
        } else {
            debug!(peer = %peer_id, "handshake verified, awaiting key confirmation");
        }

        Ok(Established {
            peer: PeerIdentity {
                public_key: msg.identity_public_key,
                label: msg.label.clone(),
                device_id: msg.device_id.clone(),
                trust: TrustLevel::Unknown,
            },
            keys,
            reply,
            confirmed,
        })
    }

    fn build(&self, kind: AuthKind, now_ms: u64, answered: Option<&[u8]>) -> AuthMessage {
        let signed = transcript(kind, &self.challenge, &self.ephemeral_public, now_ms, answered);
        AuthMessage {
            kind,
            identity_public_key: self.identity.public_key_bytes(),
            ephemeral_public_key: self.ephemeral_public,
            challenge: self.challenge.clone(),
            signature: self.engine.sign(&self.identity.keypair, &signed).to_vec(),
            label: self.identity.label.clone(),
            device_id: self.identity.device_id.clone(),
            ts: now_ms,
        }
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("initiator", &self.initiator)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

/// Bytes covered by a handshake signature.
pub(crate) fn transcript(
    kind: AuthKind,
    challenge: &[u8],
    ephemeral_public: &[u8; KEY_LEN],
    ts: u64,
    answered: Option<&[u8]>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        TRANSCRIPT_DOMAIN.len() + 1 + challenge.len() + KEY_LEN + 8 + answered.map_or(0, <[u8]>::len),
    );
    out.extend_from_slice(TRANSCRIPT_DOMAIN);
    out.push(kind.tag());
    out.extend_from_slice(challenge);
    out.extend_from_slice(ephemeral_public);
    out.extend_from_slice(&ts.to_be_bytes());
    if let Some(answered) = answered {
        out.extend_from_slice(answered);
    }
    out
}

fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DalekEngine;
    use crate::identity::IdentityKeypair;

    const NOW_MS: u64 = 1_700_000_000_000;

    fn engine() -> Arc<dyn CryptoEngine> {
        Arc::new(DalekEngine::new())
    }

    fn identity(seed: u8, label: &str) -> Arc<LocalIdentity> {
        Arc::new(LocalIdentity::new(
            IdentityKeypair::from_bytes(&[seed; KEY_LEN]),
            label,
            format!("{}-device", label),
        ))
    }

    fn handshake(id: &Arc<LocalIdentity>) -> Handshake {
        Handshake::new(engine(), id.clone(), HandshakeConfig::default(), Instant::now()).unwrap()
    }

    #[test]
    fn test_full_handshake_agrees_on_keys() {
        let alice = identity(1, "alice");
        let bob = identity(2, "bob");
        let mut a = handshake(&alice);
        let mut b = handshake(&bob);

        let challenge = a.initiate(NOW_MS).unwrap();
        assert_eq!(a.state(), HandshakeState::ChallengeSent);

        let b_done = b.handle(&challenge, NOW_MS).unwrap();
        assert_eq!(b.state(), HandshakeState::ResponseReceived);
        assert!(!b_done.confirmed);
        assert!(!b.is_initiator());
        assert_eq!(b_done.peer.public_key, alice.public_key_bytes());
        assert_eq!(b_done.peer.label, "alice");
        assert_eq!(b_done.peer.trust, TrustLevel::Unknown);

        let response = b_done.reply.expect("responder must reply");
        assert_eq!(response.kind, AuthKind::Response);

        let a_done = a.handle(&response, NOW_MS + 5).unwrap();
        assert_eq!(a.state(), HandshakeState::Verified);
        assert!(a_done.confirmed);
        assert!(a.is_initiator());
        assert!(a_done.reply.is_none());
        assert_eq!(a_done.peer.public_key, bob.public_key_bytes());
        assert_eq!(a_done.peer.device_id, "bob-device");

        assert_eq!(a_done.keys, b_done.keys);

        b.confirm().unwrap();
        assert_eq!(b.state(), HandshakeState::Verified);
    }

    #[test]
    fn test_replayed_challenge_is_never_confirmed() {
        let alice = identity(1, "alice");
        let bob = identity(2, "bob");
        let mut a = handshake(&alice);
        let challenge = a.initiate(NOW_MS).unwrap();
        drop(a);

        // The original initiator is gone; a copy of its challenge still
        // verifies, but only tentatively.
        let mut b = handshake(&bob);
        let done = b.handle(&challenge, NOW_MS + 60_000).unwrap();
        assert!(!done.confirmed);
        assert_eq!(b.state(), HandshakeState::ResponseReceived);

        b.expire();
        assert_eq!(b.state(), HandshakeState::Failed);
        assert_eq!(b.failure(), Some(&HandshakeError::Timeout));
        assert_eq!(
            b.confirm().unwrap_err(),
            HandshakeError::InvalidState {
                state: HandshakeState::Failed
            }
        );
    }

    #[test]
    fn test_confirm_requires_pending_peer() {
        let mut a = handshake(&identity(1, "alice"));
        assert!(a.confirm().is_err());
        a.initiate(NOW_MS).unwrap();
        assert_eq!(
            a.confirm().unwrap_err(),
            HandshakeError::InvalidState {
                state: HandshakeState::ChallengeSent
            }
        );
    }

    #[test]
    fn test_tampered_signature_fails() {
        let mut a = handshake(&identity(1, "alice"));
        let mut b = handshake(&identity(2, "bob"));

        let mut challenge = a.initiate(NOW_MS).unwrap();
        challenge.signature[0] ^= 0x01;

        assert_eq!(b.handle(&challenge, NOW_MS).unwrap_err(), HandshakeError::SignatureInvalid);
        assert_eq!(b.state(), HandshakeState::Failed);
        assert_eq!(b.failure(), Some(&HandshakeError::SignatureInvalid));
    }

    #[test]
    fn test_swapped_ephemeral_key_fails() {
        let mut a = handshake(&identity(1, "alice"));
        let mut b = handshake(&identity(2, "bob"));
        let mallory = handshake(&identity(3, "mallory"));

        let mut challenge = a.initiate(NOW_MS).unwrap();
        challenge.ephemeral_public_key = mallory.ephemeral_public;

        assert_eq!(b.handle(&challenge, NOW_MS).unwrap_err(), HandshakeError::SignatureInvalid);
    }

    #[test]
    fn test_response_must_answer_our_challenge() {
        let alice = identity(1, "alice");
        let bob = identity(2, "bob");
        let mut a1 = handshake(&alice);
        let mut a2 = handshake(&alice);
        let mut b = handshake(&bob);

        // Bob answers a different attempt of Alice's.
        a1.initiate(NOW_MS).unwrap();
        let other = a2.initiate(NOW_MS).unwrap();
        let response = b.handle(&other, NOW_MS).unwrap().reply.unwrap();

        assert_eq!(a1.handle(&response, NOW_MS).unwrap_err(), HandshakeError::SignatureInvalid);
    }

    #[test]
    fn test_own_identity_rejected() {
        let alice = identity(1, "alice");
        let mut a = handshake(&alice);
        let mut echo = handshake(&alice);

        let challenge = a.initiate(NOW_MS).unwrap();
        assert_eq!(echo.handle(&challenge, NOW_MS).unwrap_err(), HandshakeError::InvalidPeerKey);
    }

    #[test]
    fn test_low_order_ephemeral_rejected() {
        let mallory = identity(3, "mallory");
        let mut b = handshake(&identity(2, "bob"));

        let challenge = vec![9u8; CHALLENGE_LEN];
        let zero = [0u8; KEY_LEN];
        let signed = transcript(AuthKind::Challenge, &challenge, &zero, NOW_MS, None);
        let msg = AuthMessage {
            kind: AuthKind::Challenge,
            identity_public_key: mallory.public_key_bytes(),
            ephemeral_public_key: zero,
            challenge,
            signature: mallory.keypair.sign(&signed).to_vec(),
            label: mallory.label.clone(),
            device_id: mallory.device_id.clone(),
            ts: NOW_MS,
        };

        assert_eq!(b.handle(&msg, NOW_MS).unwrap_err(), HandshakeError::InvalidPeerKey);
        assert_eq!(b.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_short_challenge_is_malformed() {
        let mut a = handshake(&identity(1, "alice"));
        let mut b = handshake(&identity(2, "bob"));

        let mut challenge = a.initiate(NOW_MS).unwrap();
        challenge.challenge.truncate(8);
        assert!(matches!(b.handle(&challenge, NOW_MS), Err(HandshakeError::Malformed(_))));
    }

    #[test]
    fn test_clock_skew_rejected() {
        let mut a = handshake(&identity(1, "alice"));
        let mut b = handshake(&identity(2, "bob"));

        let challenge = a.initiate(NOW_MS).unwrap();
        let later = NOW_MS + 301_000;
        assert_eq!(
            b.handle(&challenge, later).unwrap_err(),
            HandshakeError::ClockSkew { skew_ms: 301_000 }
        );
    }

    #[test]
    fn test_unexpected_response_while_idle() {
        let mut a = handshake(&identity(1, "alice"));
        let mut b = handshake(&identity(2, "bob"));
        let mut c = handshake(&identity(3, "carol"));

        let challenge = a.initiate(NOW_MS).unwrap();
        let response = b.handle(&challenge, NOW_MS).unwrap().reply.unwrap();

        assert_eq!(
            c.handle(&response, NOW_MS).unwrap_err(),
            HandshakeError::UnexpectedMessage {
                kind: AuthKind::Response,
                state: HandshakeState::Idle,
            }
        );
    }

    #[test]
    fn test_finished_handshake_ignores_input() {
        let mut a = handshake(&identity(1, "alice"));
        let mut b = handshake(&identity(2, "bob"));

        let challenge = a.initiate(NOW_MS).unwrap();
        b.handle(&challenge, NOW_MS).unwrap();
        assert_eq!(b.handle(&challenge, NOW_MS).unwrap_err(), HandshakeError::Finished);
        assert_eq!(b.state(), HandshakeState::ResponseReceived);
        b.confirm().unwrap();
        assert_eq!(b.handle(&challenge, NOW_MS).unwrap_err(), HandshakeError::Finished);
        assert_eq!(a.initiate(NOW_MS).unwrap_err(), HandshakeError::InvalidState {
            state: HandshakeState::ChallengeSent,
        });
    }

    #[test]
    fn test_glare_resolves_without_extra_round_trip() {
        let alice = identity(1, "alice");
        let bob = identity(2, "bob");
        let mut a = handshake(&alice);
        let mut b = handshake(&bob);

        let from_a = a.initiate(NOW_MS).unwrap();
        let from_b = b.initiate(NOW_MS).unwrap();

        let a_done = a.handle(&from_b, NOW_MS).unwrap();
        let b_done = b.handle(&from_a, NOW_MS).unwrap();

        assert!(a_done.reply.is_none() && b_done.reply.is_none());
        // Neither challenge answered the other, so both wait for a sealed message.
        assert!(!a_done.confirmed && !b_done.confirmed);
        assert_ne!(a.is_initiator(), b.is_initiator());
        assert_eq!(a_done.keys, b_done.keys);

        b.confirm().unwrap();
        assert_eq!(b.state(), HandshakeState::Verified);
    }

    #[test]
    fn test_timeout() {
        let start = Instant::now();
        let mut a = Handshake::new(
            engine(),
            identity(1, "alice"),
            HandshakeConfig::default(),
            start,
        )
        .unwrap();
        a.initiate(NOW_MS).unwrap();

        assert!(!a.check_timeout(start + Duration::from_secs(9)));
        assert!(a.check_timeout(start + Duration::from_secs(10)));
        assert_eq!(a.state(), HandshakeState::Failed);
        assert_eq!(a.failure(), Some(&HandshakeError::Timeout));
        assert!(a.ephemeral.is_none());
    }
}
