//! WebSocket client for the room relay.
//!
//! Each `join` opens a fresh WebSocket, sends `join{room}` and then pumps
//! frames both ways on a background task. Session frames travel as base64 in
//! `signal{payload}`; the relay forwards them to the other room member.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use peerlink_common::SignalMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportEvent};

enum Outbound {
    Frame(Vec<u8>),
    Leave,
}

pub struct RelayTransport {
    url: String,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    buffered: Arc<AtomicUsize>,
    task: Option<JoinHandle<()>>,
}

impl RelayTransport {
    /// `url` is the relay's `ws://` or `wss://` endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outbound: None,
            buffered: Arc::new(AtomicUsize::new(0)),
            task: None,
        }
    }
}

impl Transport for RelayTransport {
    fn join(
        &mut self,
        room: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> peerlink_common::Result<()> {
        self.leave();

        let (tx, rx) = mpsc::unbounded_channel();
        // Fresh counter per connection so a lingering task cannot skew it.
        let buffered = Arc::new(AtomicUsize::new(0));
        self.outbound = Some(tx);
        self.buffered = buffered.clone();
        self.task = Some(tokio::spawn(run_relay(
            self.url.clone(),
            room.to_string(),
            events,
            rx,
            buffered,
        )));
        Ok(())
    }

    fn send(&mut self, frame: Vec<u8>) -> peerlink_common::Result<()> {
        let tx = self
            .outbound
            .as_ref()
            .ok_or_else(|| peerlink_common::Error::transport("not joined"))?;
        let len = frame.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        tx.send(Outbound::Frame(frame)).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            peerlink_common::Error::transport("relay connection closed")
        })
    }

    fn leave(&mut self) {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Outbound::Leave);
        }
        // The task exits on its own once it has told the relay.
        self.task = None;
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.leave();
    }
}

async fn run_relay(
    url: String,
    room: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    buffered: Arc<AtomicUsize>,
) {
    if let Err(e) = relay_loop(&url, &room, &events, outbound, &buffered).await {
        warn!("relay connection failed: {:#}", e);
        let _ = events.send(TransportEvent::Error {
            message: format!("{:#}", e),
        });
    }
}

async fn relay_loop(
    url: &str,
    room: &str,
    events: &mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    buffered: &AtomicUsize,
) -> Result<()> {
    let (ws, _) = connect_async(url)
        .await
        .with_context(|| format!("connecting to relay {}", url))?;
    let (mut sink, mut stream) = ws.split();

    let join = SignalMessage::Join {
        room: room.to_string(),
    };
    sink.send(Message::Text(join.to_json()?.into())).await?;
    info!(room, "joining relay room");

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Frame(frame)) => {
                    let len = frame.len();
                    let signal = SignalMessage::Signal {
                        payload: STANDARD.encode(&frame),
                    };
                    sink.send(Message::Text(signal.to_json()?.into())).await?;
                    buffered.fetch_sub(len, Ordering::SeqCst);
                }
                Some(Outbound::Leave) | None => {
                    let leave = SignalMessage::Leave {
                        room: room.to_string(),
                    };
                    let _ = sink.send(Message::Text(leave.to_json()?.into())).await;
                    let _ = sink.close().await;
                    debug!(room, "left relay room");
                    return Ok(());
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    dispatch(SignalMessage::from_json(&text)?, events);
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(TransportEvent::Closed {
                        reason: "relay closed the connection".into(),
                    });
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}

/// Map one relay message onto transport events.
///
/// The member already in the room initiates: a `peer_joined` opens the
/// channel as initiator, a `joined` listing a present peer opens it as
/// responder.
fn dispatch(msg: SignalMessage, events: &mpsc::UnboundedSender<TransportEvent>) {
    let emit = |event| {
        let _ = events.send(event);
    };
    match msg {
        SignalMessage::Joined { room, peer_id, peers } => {
            debug!(room = %room, peer_id = %peer_id, present = peers.len(), "relay accepted join");
            emit(TransportEvent::TransportReady);
            if let Some(present) = peers.into_iter().next() {
                emit(TransportEvent::PeerJoined { peer_id: present });
                emit(TransportEvent::ChannelOpen { initiator: false });
            }
        }
        SignalMessage::PeerJoined { peer_id } => {
            emit(TransportEvent::PeerJoined { peer_id });
            emit(TransportEvent::ChannelOpen { initiator: true });
        }
        SignalMessage::PeerLeft { peer_id } => {
            emit(TransportEvent::PeerLeft { peer_id });
            emit(TransportEvent::Closed {
                reason: "peer left".into(),
            });
        }
        SignalMessage::Signal { payload } => match STANDARD.decode(payload.as_bytes()) {
            Ok(frame) => emit(TransportEvent::Message(frame)),
            Err(e) => warn!("dropping signal with bad payload: {}", e),
        },
        SignalMessage::Error { code, message } => {
            warn!(?code, "relay error: {}", message);
            emit(TransportEvent::Error { message });
        }
        SignalMessage::Join { .. } | SignalMessage::Leave { .. } => {
            debug!("ignoring client-only relay message");
        }
    }
}
