//! End-to-end handshake and codec tests over an in-memory byte pipe.

use std::sync::Arc;
use std::time::Instant;

use peerlink_crypto::{
    AuthKind, CryptoEngine, CodecError, DalekEngine, Established, Frame, Handshake, HandshakeConfig,
    HandshakeError, HandshakeState, IdentityKeypair, LocalIdentity, SessionCodec,
};
use tokio::sync::mpsc;

const NOW_MS: u64 = 1_700_000_000_000;
const WINDOW_MS: u64 = 300_000;

fn identity(engine: &dyn CryptoEngine, label: &str) -> Arc<LocalIdentity> {
    let keypair = engine.generate_identity_keypair().unwrap();
    Arc::new(LocalIdentity::new(keypair, label, format!("{}-phone", label)))
}

/// Drive one side of the handshake over byte channels, like a transport would.
async fn run_side(
    engine: Arc<dyn CryptoEngine>,
    identity: Arc<LocalIdentity>,
    initiator: bool,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<Established, HandshakeError> {
    let mut handshake = Handshake::new(engine, identity, HandshakeConfig::default(), Instant::now())?;
    if initiator {
        let challenge = handshake.initiate(NOW_MS)?;
        tx.send(Frame::Auth(challenge).encode().unwrap()).unwrap();
    }

    let Some(bytes) = rx.recv().await else {
        return Err(HandshakeError::Timeout);
    };
    let Frame::Auth(msg) = Frame::decode(&bytes).unwrap() else {
        panic!("unexpected data frame during handshake");
    };
    let established = handshake.handle(&msg, NOW_MS)?;
    if let Some(reply) = &established.reply {
        tx.send(Frame::Auth(reply.clone()).encode().unwrap()).unwrap();
    }
    Ok(established)
}

async fn establish(
    engine: Arc<dyn CryptoEngine>,
    alice: Arc<LocalIdentity>,
    bob: Arc<LocalIdentity>,
) -> (Established, Established) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = tokio::spawn(run_side(engine.clone(), alice, true, a_tx, a_rx));
    let b = tokio::spawn(run_side(engine, bob, false, b_tx, b_rx));

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    (a, b)
}

#[tokio::test]
async fn test_peers_derive_identical_keys() {
    let engine: Arc<dyn CryptoEngine> = Arc::new(DalekEngine::new());
    let alice = identity(engine.as_ref(), "alice");
    let bob = identity(engine.as_ref(), "bob");

    let (a, b) = establish(engine, alice.clone(), bob.clone()).await;

    assert_eq!(a.keys, b.keys);
    assert!(a.confirmed, "initiator saw its challenge answered");
    assert!(!b.confirmed, "responder waits for a sealed message");
    assert_eq!(a.peer.public_key, bob.public_key_bytes());
    assert_eq!(a.peer.label, "bob");
    assert_eq!(b.peer.public_key, alice.public_key_bytes());
    assert_eq!(b.peer.label, "alice");
    assert_eq!(a.peer.fingerprint().len(), 19);
}

#[tokio::test]
async fn test_established_codecs_talk() {
    let engine: Arc<dyn CryptoEngine> = Arc::new(DalekEngine::new());
    let alice = identity(engine.as_ref(), "alice");
    let bob = identity(engine.as_ref(), "bob");

    let (a, b) = establish(engine.clone(), alice.clone(), bob.clone()).await;

    let mut a_codec = SessionCodec::new(
        engine.clone(),
        a.keys,
        alice.public_key_bytes(),
        a.peer.public_key,
        WINDOW_MS,
    );
    let mut b_codec = SessionCodec::new(engine, b.keys, bob.public_key_bytes(), b.peer.public_key, WINDOW_MS);

    for i in 0..10u8 {
        let sealed = a_codec.seal(&[i; 100], NOW_MS).unwrap();
        let bytes = Frame::Data(sealed).encode().unwrap();
        let Frame::Data(received) = Frame::decode(&bytes).unwrap() else {
            panic!("expected data frame");
        };
        assert_eq!(b_codec.open(&received, NOW_MS).unwrap(), vec![i; 100]);
    }
}

#[tokio::test]
async fn test_every_attempt_uses_fresh_ephemeral_keys() {
    let engine: Arc<dyn CryptoEngine> = Arc::new(DalekEngine::new());
    let alice = identity(engine.as_ref(), "alice");
    let bob = identity(engine.as_ref(), "bob");

    let mut first = Handshake::new(engine.clone(), alice.clone(), HandshakeConfig::default(), Instant::now()).unwrap();
    let mut second = Handshake::new(engine.clone(), alice.clone(), HandshakeConfig::default(), Instant::now()).unwrap();
    let c1 = first.initiate(NOW_MS).unwrap();
    let c2 = second.initiate(NOW_MS).unwrap();
    assert_ne!(c1.ephemeral_public_key, c2.ephemeral_public_key);
    assert_ne!(c1.challenge, c2.challenge);

    // Keys from one session cannot open traffic from another between the same peers.
    let (a1, b1) = establish(engine.clone(), alice.clone(), bob.clone()).await;
    let (a2, _b2) = establish(engine.clone(), alice.clone(), bob.clone()).await;
    assert_ne!(a1.keys, a2.keys);

    let mut session2_alice = SessionCodec::new(
        engine.clone(),
        a2.keys,
        alice.public_key_bytes(),
        bob.public_key_bytes(),
        WINDOW_MS,
    );
    let mut session1_bob = SessionCodec::new(
        engine,
        b1.keys,
        bob.public_key_bytes(),
        alice.public_key_bytes(),
        WINDOW_MS,
    );
    drop(a1);

    let sealed = session2_alice.seal(b"secret", NOW_MS).unwrap();
    assert_eq!(
        session1_bob.open(&sealed, NOW_MS).unwrap_err(),
        CodecError::AuthenticationFailed
    );
}

#[tokio::test]
async fn test_impersonation_fails() {
    let engine: Arc<dyn CryptoEngine> = Arc::new(DalekEngine::new());
    let alice = identity(engine.as_ref(), "alice");
    let mallory = Arc::new(LocalIdentity::new(
        IdentityKeypair::from_bytes(&[0x42; 32]),
        "alice",
        "alice-phone",
    ));
    let bob = identity(engine.as_ref(), "bob");

    // Mallory claims Alice's identity key but can only sign with their own.
    let mut forger = Handshake::new(engine.clone(), mallory, HandshakeConfig::default(), Instant::now()).unwrap();
    let mut challenge = forger.initiate(NOW_MS).unwrap();
    challenge.identity_public_key = alice.public_key_bytes();
    assert_eq!(challenge.kind, AuthKind::Challenge);

    let mut responder = Handshake::new(engine, bob, HandshakeConfig::default(), Instant::now()).unwrap();
    assert_eq!(
        responder.handle(&challenge, NOW_MS).unwrap_err(),
        HandshakeError::SignatureInvalid
    );
    assert_eq!(responder.state(), HandshakeState::Failed);
}
