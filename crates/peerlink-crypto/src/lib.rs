//! Cryptographic core for Peerlink.
//!
//! This crate provides:
//! - Ed25519 identity keys and peer ids
//! - A pluggable [`CryptoEngine`] with one compiled-in backend ([`DalekEngine`])
//! - The signed ephemeral key exchange that turns two identities into
//!   confirmed [`SessionKeys`] ([`Handshake`])
//! - The AEAD message codec with replay protection ([`SessionCodec`])
//!
//! # Design
//!
//! Every connection attempt generates a fresh X25519 ephemeral pair. Each side
//! signs its challenge and ephemeral key with its long-term Ed25519 identity,
//! so the peer can authenticate the key exchange, and the resulting session
//! keys are forward secret: once the ephemeral secrets are dropped, the
//! identity keys alone cannot recover past traffic.
//!
//! Application messages use ChaCha20-Poly1305 with an explicit per-direction
//! counter nonce and the sender timestamp in the associated data, which lets
//! the receiver enforce both a counter window and a clock-skew window.

#![forbid(unsafe_code)]

pub mod codec;
pub mod engine;
pub mod handshake;
pub mod identity;
pub mod keys;
pub mod replay;
pub mod wire;

pub use codec::{CodecError, SessionCodec};
pub use engine::{CryptoEngine, CryptoError, DalekEngine};
pub use handshake::{Established, Handshake, HandshakeConfig, HandshakeError, HandshakeState};
pub use identity::{IdentityKeypair, LocalIdentity, PeerId, PeerIdentity, TrustLevel};
pub use keys::{EphemeralKeypair, SessionKeys, SharedSecret};
pub use replay::{ReplayGuard, ReplayRejection};
pub use wire::{AuthKind, AuthMessage, EncryptedMessage, Frame, WireError, DATA_FRAME_OVERHEAD};
