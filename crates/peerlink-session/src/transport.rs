//! Contract between the session actor and whatever carries its bytes.
//!
//! A transport joins a relay room, reports room and channel lifecycle through
//! [`TransportEvent`]s, and moves opaque frames to the other member. It never
//! inspects the frames.

use peerlink_common::Result;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    /// The relay accepted our join.
    TransportReady,
    /// A channel to the other member is usable. `initiator` tells which side
    /// starts the handshake.
    ChannelOpen { initiator: bool },
    Message(Vec<u8>),
    Closed { reason: String },
    Error { message: String },
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Calls are made from the session task and must not block.
pub trait Transport: Send {
    /// Enter `room`. Events for this membership go to `events`; a later
    /// `join` replaces the sink, so events from older memberships are never
    /// mixed in.
    fn join(&mut self, room: &str, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()>;

    fn send(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Leave the current room, if any. Idempotent.
    fn leave(&mut self);

    /// Bytes accepted by `send` but not yet handed to the network.
    fn buffered_amount(&self) -> usize;
}
