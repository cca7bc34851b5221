use peerlink_crypto::{PeerId, PeerIdentity};

use crate::health::LinkQuality;
use crate::state::ConnectionState;

/// Error categories reported on the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Relay or channel failure; reconnect is attempted.
    Transport,
    /// Handshake failed; no automatic retry.
    Authentication,
    /// A received message failed to authenticate or decode and was dropped.
    Crypto,
    /// A received message was a replay or outside the clock window. Dropped
    /// without counting against the peer.
    ReplayOrClockSkew,
    /// Too many undecodable or unauthenticated messages in a short window;
    /// the session was dropped.
    SuspiciousTraffic,
    MaxRetriesExceeded,
}

/// Everything the application hears from a session, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Authenticated(PeerIdentity),
    MessageReceived {
        plaintext: Vec<u8>,
        peer: PeerId,
    },
    QualityChanged {
        degraded: bool,
        quality: LinkQuality,
    },
    Error {
        kind: ErrorKind,
        detail: String,
    },
}
