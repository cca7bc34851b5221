use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest text frame accepted from the relay.
pub const MAX_SIGNAL_BYTES: usize = 8 * 1024 * 1024;

/// Room-relay signaling message.
///
/// The relay stores and forwards opaque `signal` payloads between the two
/// members of a room; it never sees session plaintext.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Ask the relay to place this connection in `room`.
    Join { room: String },

    /// Leave the current room.
    Leave { room: String },

    /// Relay acknowledgement of `join`. `peers` lists members already present.
    Joined {
        room: String,
        peer_id: String,
        #[serde(default)]
        peers: Vec<String>,
    },

    /// Another member entered the room.
    PeerJoined { peer_id: String },

    /// Another member left the room or dropped.
    PeerLeft { peer_id: String },

    /// Opaque payload for the other member (base64 encoded).
    Signal { payload: String },

    /// Generic error message from the relay.
    Error {
        #[serde(default)]
        code: Option<u16>,
        message: String,
    },
}

impl SignalMessage {
    /// Serialize to the relay's JSON text form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a relay JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        if text.len() > MAX_SIGNAL_BYTES {
            return Err(Error::protocol(format!(
                "signal frame too large: {} bytes",
                text.len()
            )));
        }
        Ok(serde_json::from_str(text)?)
    }
}
