//! The connection state machine.
//!
//! One tokio task owns all session state: the transport, the in-flight
//! handshake, the codec with its keys, the health monitor and the reconnect
//! backoff. Callers talk to it through [`SessionHandle`] (an mpsc mailbox
//! with oneshot replies) and listen on the ordered [`SessionEvents`] stream.
//!
//! The task waits on three sources: commands, transport events, and a single
//! state timer. The timer is replaced on every state transition, so a stale
//! timeout can never fire in a later state.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use peerlink_common::helpers::now_ms;
use peerlink_crypto::{
    AuthKind, AuthMessage, CodecError, CryptoEngine, EncryptedMessage, Established, Frame, Handshake,
    HandshakeConfig, HandshakeError, HandshakeState, LocalIdentity, PeerIdentity, SessionCodec,
    DATA_FRAME_OVERHEAD,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::events::{ErrorKind, SessionEvent};
use crate::health::{HealthMonitor, LinkQuality, TickOutcome};
use crate::payload::Payload;
use crate::state::ConnectionState;
use crate::transport::{Transport, TransportEvent, TransportEvents};
use crate::trust::TrustStore;

const COMMAND_CAPACITY: usize = 64;

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

enum Command {
    Connect {
        room: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        plaintext: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Join `room` and bring up an authenticated session with its other
    /// member. Returns once signaling has started; progress is reported on
    /// the event stream. Resets the reconnect backoff.
    pub async fn connect(&self, room: impl Into<String>) -> Result<()> {
        let room = room.into();
        self.request(|reply| Command::Connect { room, reply }).await?
    }

    /// Seal and send application data to the verified peer.
    pub async fn send_encrypted(&self, plaintext: impl Into<Vec<u8>>) -> Result<()> {
        let plaintext = plaintext.into();
        self.request(|reply| Command::Send { plaintext, reply }).await?
    }

    /// Drop the session and its keys; the handle stays usable for `connect`.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Tear down for good. The session task exits.
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        self.request(|reply| Command::State { reply }).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

/// Start a session task. Must be called from within a tokio runtime.
pub fn spawn_session(
    config: SessionConfig,
    engine: Arc<dyn CryptoEngine>,
    trust: Arc<dyn TrustStore>,
    transport: Box<dyn Transport>,
) -> Result<(SessionHandle, SessionEvents)> {
    config
        .validate()
        .map_err(|e| SessionError::Config(e.to_string()))?;

    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4();

    let actor = Actor {
        backoff: Backoff::new(
            config.backoff_base,
            config.backoff_max,
            config.max_reconnect_attempts,
        ),
        identity: trust.local_identity(),
        config,
        engine,
        trust,
        transport,
        transport_events: None,
        commands: command_rx,
        events: event_tx,
        state: ConnectionState::Disconnected,
        room: None,
        handshake: None,
        active: None,
        timer: None,
        crypto_failures: VecDeque::new(),
    };
    tokio::spawn(actor.run().instrument(info_span!("session", %id)));

    Ok((
        SessionHandle {
            id,
            commands: command_tx,
        },
        event_rx,
    ))
}

/// Verified session material; dropping it zeroizes the keys.
struct ActiveSession {
    peer: PeerIdentity,
    codec: SessionCodec,
    health: HealthMonitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    TransportSetup,
    Handshake,
    Health,
    Backoff,
}

enum Flow {
    Continue,
    Exit,
}

struct Actor {
    config: SessionConfig,
    engine: Arc<dyn CryptoEngine>,
    trust: Arc<dyn TrustStore>,
    identity: Arc<LocalIdentity>,
    transport: Box<dyn Transport>,
    transport_events: Option<TransportEvents>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: ConnectionState,
    room: Option<String>,
    backoff: Backoff,
    handshake: Option<Handshake>,
    active: Option<ActiveSession>,
    timer: Option<(Instant, Timer)>,
    crypto_failures: VecDeque<Instant>,
}

impl Actor {
    async fn run(mut self) {
        info!(peer_id = %self.identity.keypair.peer_id(), "session started");
        loop {
            let deadline = self.timer.map(|(at, _)| at);
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("all session handles dropped");
                        self.shutdown();
                        break;
                    };
                    if let Flow::Exit = self.on_command(cmd) {
                        break;
                    }
                }
                event = next_transport_event(&mut self.transport_events) => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        self.transport_events = None;
                        self.on_transport_failure("transport event stream ended".into());
                    }
                },
                _ = sleep_until_opt(deadline) => {
                    if let Some((_, timer)) = self.timer.take() {
                        self.on_timer(timer);
                    }
                }
            }
        }
        info!("session stopped");
    }

    fn on_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Connect { room, reply } => {
                let _ = reply.send(self.connect(room));
            }
            Command::Send { plaintext, reply } => {
                let result = if self.state.is_active() {
                    self.send_payload(&Payload::App(plaintext))
                } else {
                    Err(SessionError::NotConnected { state: self.state })
                };
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Close { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return Flow::Exit;
            }
            Command::State { reply } => {
                let _ = reply.send(self.state);
            }
        }
        Flow::Continue
    }

    fn connect(&mut self, room: String) -> Result<()> {
        // Reconnecting is owned by the backoff; a caller cannot reset it early.
        if self.state != ConnectionState::Disconnected {
            return Err(SessionError::InvalidState { state: self.state });
        }
        info!(room = %room, "connect requested");
        self.backoff.reset();
        self.room = Some(room);
        self.begin_signaling();
        Ok(())
    }

    /// Fresh join: new event sink, and later a new handshake with new
    /// ephemeral keys.
    fn begin_signaling(&mut self) {
        let Some(room) = self.room.clone() else {
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport_events = Some(rx);
        self.transition(ConnectionState::Signaling);
        self.arm(Timer::TransportSetup, self.config.transport_timeout);

        if let Err(e) = self.transport.join(&room, tx) {
            self.on_transport_failure(format!("join failed: {}", e));
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::TransportReady => {
                if self.state == ConnectionState::Signaling {
                    self.transition(ConnectionState::TransportEstablishing);
                    self.arm(Timer::TransportSetup, self.config.transport_timeout);
                }
            }
            TransportEvent::PeerJoined { peer_id } => debug!(peer_id = %peer_id, "peer joined room"),
            TransportEvent::PeerLeft { peer_id } => debug!(peer_id = %peer_id, "peer left room"),
            TransportEvent::ChannelOpen { initiator } => {
                if matches!(
                    self.state,
                    ConnectionState::Signaling | ConnectionState::TransportEstablishing
                ) {
                    if let Err(e) = self.start_handshake(initiator) {
                        self.on_auth_failure(e);
                    }
                } else {
                    debug!(state = %self.state, "ignoring channel open");
                }
            }
            TransportEvent::Message(bytes) => self.on_frame(&bytes),
            TransportEvent::Closed { reason } => {
                self.on_transport_failure(format!("channel closed: {}", reason))
            }
            TransportEvent::Error { message } => self.on_transport_failure(message),
        }
    }

    fn start_handshake(&mut self, initiator: bool) -> std::result::Result<(), HandshakeError> {
        let config = HandshakeConfig {
            timeout: self.config.handshake_timeout,
            max_clock_skew: self.config.replay_window,
        };
        let mut handshake = Handshake::new(
            self.engine.clone(),
            self.identity.clone(),
            config,
            Instant::now().into_std(),
        )?;
        let challenge = if initiator {
            Some(handshake.initiate(now_ms())?)
        } else {
            None
        };

        self.transition(ConnectionState::Authenticating);
        self.arm(Timer::Handshake, self.config.handshake_timeout);
        self.handshake = Some(handshake);
        info!(initiator, "authenticating peer");

        if let Some(challenge) = challenge {
            self.send_frame(&Frame::Auth(challenge));
        }
        Ok(())
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(Frame::Auth(msg)) => self.on_auth_message(msg),
            Ok(Frame::Data(msg)) => self.on_data(msg),
            Err(e) => self.on_crypto_failure(ErrorKind::Crypto, format!("undecodable frame: {}", e)),
        }
    }

    fn on_auth_message(&mut self, msg: AuthMessage) {
        // The peer's challenge can overtake our own channel-open notice.
        if self.state == ConnectionState::TransportEstablishing && msg.kind == AuthKind::Challenge {
            if let Err(e) = self.start_handshake(false) {
                self.on_auth_failure(e);
                return;
            }
        }

        let Some(handshake) = self.handshake.as_mut() else {
            debug!(state = %self.state, kind = ?msg.kind, "dropping stray handshake message");
            return;
        };
        match handshake.handle(&msg, now_ms()) {
            Ok(mut established) => {
                if let Some(reply) = established.reply.take() {
                    if !self.send_frame(&Frame::Auth(reply)) {
                        return;
                    }
                }
                self.on_established(established);
            }
            Err(HandshakeError::Finished) => {
                debug!(kind = ?msg.kind, "dropping handshake message after key agreement");
            }
            Err(e) => self.on_auth_failure(e),
        }
    }

    /// Keys agreed. A peer that has not yet proven liveness stays tentative
    /// in `Authenticating` until a message sealed under these keys arrives.
    fn on_established(&mut self, established: Established) {
        let Established {
            peer,
            keys,
            confirmed,
            ..
        } = established;

        let codec = SessionCodec::new(
            self.engine.clone(),
            keys,
            self.identity.public_key_bytes(),
            peer.public_key,
            self.config.replay_window.as_millis() as u64,
        );
        let health = HealthMonitor::new(
            self.config.rtt_degraded_ms,
            self.config.loss_degraded,
            self.config.max_missed_pings,
        );
        self.active = Some(ActiveSession {
            peer,
            codec,
            health,
        });

        // Our first sealed message is what confirms the keys to the peer.
        if let Err(e) = self.send_payload(&Payload::Confirm) {
            debug!("key confirmation not sent: {}", e);
        }
        if self.state != ConnectionState::Authenticating {
            return;
        }
        if confirmed {
            self.on_verified();
        } else {
            debug!("awaiting key confirmation from peer");
        }
    }

    fn on_verified(&mut self) {
        if let Some(handshake) = self.handshake.as_mut() {
            if handshake.state() == HandshakeState::ResponseReceived {
                if let Err(e) = handshake.confirm() {
                    self.on_auth_failure(e);
                    return;
                }
            }
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let known = self.trust.lookup_trust(&active.peer.public_key);
        active.peer.trust = self.trust.record_successful_auth(&active.peer.public_key);
        let peer = active.peer.clone();
        info!(
            peer = %peer.peer_id(),
            label = %peer.label,
            fingerprint = %peer.fingerprint(),
            was = ?known,
            trust = ?peer.trust,
            "peer authenticated"
        );

        self.transition(ConnectionState::Connected);
        self.backoff.reset();
        self.arm_health();
        self.emit(SessionEvent::Authenticated(peer));
    }

    fn on_auth_failure(&mut self, err: HandshakeError) {
        warn!("authentication failed: {}", err);
        self.emit(SessionEvent::Error {
            kind: ErrorKind::Authentication,
            detail: err.to_string(),
        });
        self.drop_transport();
        self.transition(ConnectionState::Disconnected);
    }

    fn on_data(&mut self, msg: EncryptedMessage) {
        let now = now_ms();
        let opened = match self.active.as_mut() {
            Some(active) => active
                .codec
                .open(&msg, now)
                .map(|plaintext| (plaintext, active.peer.peer_id())),
            None => {
                debug!(state = %self.state, "dropping data frame outside a session");
                return;
            }
        };
        let (plaintext, peer) = match opened {
            Ok(opened) => opened,
            Err(CodecError::ReplayOrClockSkew(rejection)) => {
                // Relays may re-deliver; a duplicate is dropped, not held against the peer.
                self.on_dropped_message(ErrorKind::ReplayOrClockSkew, rejection.to_string());
                return;
            }
            Err(e) => {
                self.on_crypto_failure(ErrorKind::Crypto, e.to_string());
                return;
            }
        };

        if self.state == ConnectionState::Authenticating {
            self.on_verified();
            if !self.state.is_active() {
                return;
            }
        }

        match Payload::decode(&plaintext) {
            Ok(Payload::App(data)) => self.emit(SessionEvent::MessageReceived {
                plaintext: data,
                peer,
            }),
            Ok(Payload::Ping { id, sent_ms }) => {
                if let Err(e) = self.send_payload(&Payload::Pong { id, sent_ms }) {
                    debug!("pong not sent: {}", e);
                }
            }
            Ok(Payload::Pong { id, .. }) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if let Some(rtt) = active.health.on_pong(id, now) {
                    debug!(rtt_ms = rtt, "pong");
                }
                let change = active.health.evaluate();
                let quality = active.health.quality();
                if let Some(degraded) = change {
                    self.on_quality_change(degraded, quality);
                }
            }
            Ok(Payload::Confirm) => debug!(peer = %peer, "peer confirmed session keys"),
            Ok(Payload::Close) => {
                info!(peer = %peer, "peer closed the session");
                self.on_transport_failure("peer closed the session".into());
            }
            Err(e) => self.on_crypto_failure(ErrorKind::Crypto, format!("bad payload: {}", e)),
        }
    }

    fn on_quality_change(&mut self, degraded: bool, quality: LinkQuality) {
        info!(degraded, rtt_ms = ?quality.rtt_ms, loss = quality.loss, "link quality changed");
        self.emit(SessionEvent::QualityChanged { degraded, quality });

        let to = if degraded {
            ConnectionState::Degraded
        } else {
            ConnectionState::Connected
        };
        if self.state.is_active() && self.state != to {
            self.transition(to);
            self.arm_health();
        }
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::TransportSetup => {
                if matches!(
                    self.state,
                    ConnectionState::Signaling | ConnectionState::TransportEstablishing
                ) {
                    self.on_transport_failure(format!(
                        "no channel within {:?}",
                        self.config.transport_timeout
                    ));
                }
            }
            Timer::Handshake => {
                if let Some(handshake) = self.handshake.as_mut() {
                    handshake.expire();
                }
                if self.state == ConnectionState::Authenticating {
                    self.on_auth_failure(HandshakeError::Timeout);
                }
            }
            Timer::Health => self.on_health_tick(),
            Timer::Backoff => {
                if self.state == ConnectionState::Reconnecting {
                    info!(attempt = self.backoff.attempt(), "reconnecting");
                    self.begin_signaling();
                }
            }
        }
    }

    fn on_health_tick(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let outcome = active.health.on_tick(now_ms());
        let change = active.health.evaluate();
        let quality = active.health.quality();

        match outcome {
            TickOutcome::Unresponsive { missed } => {
                self.on_transport_failure(format!("{} consecutive pings unanswered", missed));
            }
            TickOutcome::SendPing(ping) => {
                if let Some(degraded) = change {
                    self.on_quality_change(degraded, quality);
                }
                self.arm_health();
                let ping = Payload::Ping {
                    id: ping.id,
                    sent_ms: ping.sent_ms,
                };
                if let Err(e) = self.send_payload(&ping) {
                    debug!("ping not sent: {}", e);
                }
            }
        }
    }

    fn on_dropped_message(&mut self, kind: ErrorKind, detail: String) {
        warn!(?kind, "dropping message: {}", detail);
        self.emit(SessionEvent::Error { kind, detail });
    }

    /// Counts toward the suspicious-traffic threshold; past it the session
    /// is dropped without reconnecting.
    fn on_crypto_failure(&mut self, kind: ErrorKind, detail: String) {
        self.on_dropped_message(kind, detail);

        let now = Instant::now();
        let window = self.config.crypto_failure_window;
        while let Some(&first) = self.crypto_failures.front() {
            if now.duration_since(first) <= window {
                break;
            }
            self.crypto_failures.pop_front();
        }
        self.crypto_failures.push_back(now);

        let failures = self.crypto_failures.len();
        if failures > self.config.max_crypto_failures as usize {
            warn!(failures, "suspicious traffic, dropping session");
            self.emit(SessionEvent::Error {
                kind: ErrorKind::SuspiciousTraffic,
                detail: format!("{} bad messages within {:?}", failures, window),
            });
            self.drop_transport();
            self.transition(ConnectionState::Disconnected);
        }
    }

    /// Recoverable failure: reconnect with backoff, or give up.
    fn on_transport_failure(&mut self, detail: String) {
        if !(self.state.is_establishing() || self.state.is_active()) {
            debug!(state = %self.state, "ignoring transport failure: {}", detail);
            return;
        }
        warn!(state = %self.state, "transport failure: {}", detail);
        self.emit(SessionEvent::Error {
            kind: ErrorKind::Transport,
            detail,
        });
        self.drop_transport();

        match self.backoff.next_delay() {
            Some(delay) => {
                self.transition(ConnectionState::Reconnecting);
                self.arm(Timer::Backoff, delay);
                info!(
                    attempt = self.backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
            }
            None => {
                let err = SessionError::MaxRetriesExceeded {
                    attempts: self.backoff.attempt(),
                };
                warn!("{}", err);
                self.emit(SessionEvent::Error {
                    kind: ErrorKind::MaxRetriesExceeded,
                    detail: err.to_string(),
                });
                self.transition(ConnectionState::Disconnected);
            }
        }
    }

    fn disconnect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Closed
        ) {
            return;
        }
        if self.state.is_active() {
            // Best effort; the peer treats it like a closed channel.
            let close = Payload::Close.encode().map_err(SessionError::from);
            match close.and_then(|plaintext| self.seal(&plaintext)) {
                Ok(frame) => {
                    let _ = self.transport.send(frame);
                }
                Err(e) => debug!("close notice not sent: {}", e),
            }
        }
        info!(state = %self.state, "disconnecting");
        self.drop_transport();
        self.transition(ConnectionState::Disconnected);
    }

    fn shutdown(&mut self) {
        self.disconnect();
        self.transition(ConnectionState::Closed);
    }

    fn drop_transport(&mut self) {
        self.transport.leave();
        self.transport_events = None;
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let state = self.state;
        let active = self
            .active
            .as_mut()
            .ok_or(SessionError::NotConnected { state })?;
        let sealed = active.codec.seal(plaintext, now_ms())?;
        Ok(Frame::Data(sealed).encode()?)
    }

    /// Checks backpressure against the largest frame `payload` can become
    /// before sealing, so a rejected send never consumes a nonce.
    fn send_payload(&mut self, payload: &Payload) -> Result<()> {
        let plaintext = payload.encode()?;
        let pending = self
            .transport
            .buffered_amount()
            .saturating_add(plaintext.len() + DATA_FRAME_OVERHEAD);
        if pending > self.config.max_buffered_bytes {
            return Err(SessionError::BackpressureExceeded {
                pending,
                limit: self.config.max_buffered_bytes,
            });
        }
        let frame = self.seal(&plaintext)?;
        if let Err(e) = self.transport.send(frame) {
            self.on_transport_failure(format!("send failed: {}", e));
            return Err(e.into());
        }
        Ok(())
    }

    /// Returns false when the transport failed (and recovery has started).
    fn send_frame(&mut self, frame: &Frame) -> bool {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("frame not encodable: {}", e);
                return false;
            }
        };
        match self.transport.send(bytes) {
            Ok(()) => true,
            Err(e) => {
                self.on_transport_failure(format!("send failed: {}", e));
                false
            }
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.state;
        if from == to {
            return;
        }
        debug_assert!(from.can_transition_to(to), "{} -> {}", from, to);

        self.state = to;
        self.timer = None;
        if to != ConnectionState::Authenticating {
            self.handshake = None;
        }
        if !to.is_active() {
            self.active = None;
            self.crypto_failures.clear();
        }
        info!(%from, %to, "state changed");
        self.emit(SessionEvent::StateChanged { from, to });
    }

    fn arm(&mut self, timer: Timer, after: Duration) {
        self.timer = Some((Instant::now() + after, timer));
    }

    fn arm_health(&mut self) {
        if self.config.health_checks {
            self.arm(Timer::Health, self.config.health_interval);
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_transport_event(events: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
