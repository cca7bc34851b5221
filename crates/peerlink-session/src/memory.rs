//! In-process room relay.
//!
//! Behaves like the WebSocket relay from the session's point of view (two
//! members per room, the member already present initiates) and adds fault
//! injection for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peerlink_common::{Error, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{Transport, TransportEvent};

const ROOM_CAPACITY: usize = 2;

#[derive(Debug)]
struct Member {
    id: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Debug, Default)]
struct Hub {
    rooms: HashMap<String, Vec<Member>>,
    next_id: u64,
}

#[derive(Debug, Default)]
struct Shared {
    hub: Mutex<Hub>,
    fail_joins: AtomicBool,
    blackhole: AtomicBool,
    forwarded: AtomicU64,
}

/// Shared hub; clone it to hand out transports.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    shared: Arc<Shared>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            relay: self.clone(),
            membership: None,
            buffered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Drop every member of `room` as if the relay connection broke.
    pub fn sever(&self, room: &str) {
        let members = self.hub().rooms.remove(room).unwrap_or_default();
        debug!(room, members = members.len(), "severing room");
        for member in members {
            let _ = member.events.send(TransportEvent::Closed {
                reason: "relay connection lost".into(),
            });
        }
    }

    /// Refuse all joins until switched off.
    pub fn fail_joins(&self, fail: bool) {
        self.shared.fail_joins.store(fail, Ordering::SeqCst);
    }

    /// Silently discard frames instead of forwarding them.
    pub fn set_blackhole(&self, enabled: bool) {
        self.shared.blackhole.store(enabled, Ordering::SeqCst);
    }

    /// Frames delivered to a peer so far.
    pub fn frames_forwarded(&self) -> u64 {
        self.shared.forwarded.load(Ordering::SeqCst)
    }

    pub fn members(&self, room: &str) -> usize {
        self.hub().rooms.get(room).map_or(0, Vec::len)
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.shared.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One member's view of a [`MemoryRelay`].
#[derive(Debug)]
pub struct MemoryTransport {
    relay: MemoryRelay,
    membership: Option<(String, u64)>,
    buffered: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Handle for simulating a send backlog; `buffered_amount` reports it.
    pub fn buffer_gauge(&self) -> Arc<AtomicUsize> {
        self.buffered.clone()
    }
}

impl Transport for MemoryTransport {
    fn join(&mut self, room: &str, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        self.leave();
        if self.relay.shared.fail_joins.load(Ordering::SeqCst) {
            return Err(Error::transport("relay refused join"));
        }

        let mut hub = self.relay.hub();
        let id = hub.next_id;
        hub.next_id += 1;

        let members = hub.rooms.entry(room.to_string()).or_default();
        if members.len() >= ROOM_CAPACITY {
            return Err(Error::transport(format!("room {} is full", room)));
        }

        let _ = events.send(TransportEvent::TransportReady);
        if let Some(present) = members.first() {
            let _ = present.events.send(TransportEvent::PeerJoined {
                peer_id: id.to_string(),
            });
            let _ = present.events.send(TransportEvent::ChannelOpen { initiator: true });
            let _ = events.send(TransportEvent::PeerJoined {
                peer_id: present.id.to_string(),
            });
            let _ = events.send(TransportEvent::ChannelOpen { initiator: false });
        }
        members.push(Member { id, events });
        drop(hub);

        debug!(room, member = id, "joined memory room");
        self.membership = Some((room.to_string(), id));
        Ok(())
    }

    fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        let Some((room, id)) = &self.membership else {
            return Err(Error::transport("not in a room"));
        };
        if self.relay.shared.blackhole.load(Ordering::SeqCst) {
            return Ok(());
        }

        let hub = self.relay.hub();
        let peer = hub
            .rooms
            .get(room)
            .and_then(|members| members.iter().find(|m| m.id != *id))
            .ok_or_else(|| Error::transport("no peer in room"))?;
        peer.events
            .send(TransportEvent::Message(frame))
            .map_err(|_| Error::transport("peer went away"))?;
        self.relay.shared.forwarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn leave(&mut self) {
        let Some((room, id)) = self.membership.take() else {
            return;
        };
        let mut hub = self.relay.hub();
        let Some(members) = hub.rooms.get_mut(&room) else {
            return;
        };
        let before = members.len();
        members.retain(|m| m.id != id);
        if members.len() == before {
            // Already removed by `sever`.
            return;
        }
        for other in members.iter() {
            let _ = other.events.send(TransportEvent::PeerLeft {
                peer_id: id.to_string(),
            });
            let _ = other.events.send(TransportEvent::Closed {
                reason: "peer left".into(),
            });
        }
        if members.is_empty() {
            hub.rooms.remove(&room);
        }
        debug!(room, member = id, "left memory room");
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.leave();
    }
}
