//! Connection lifecycle for Peerlink.
//!
//! A session joins a relay room, authenticates the other member with the
//! signed ephemeral key exchange from `peerlink-crypto`, and then carries
//! sealed application messages until either side leaves. Drops are retried
//! with capped exponential backoff; authentication failures are not.
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerlink_crypto::{CryptoEngine, DalekEngine, LocalIdentity};
//! use peerlink_session::{spawn_session, MemoryTrustStore, RelayTransport, SessionConfig};
//!
//! # async fn run() -> peerlink_session::Result<()> {
//! let engine: Arc<dyn CryptoEngine> = Arc::new(DalekEngine::new());
//! let keypair = engine.generate_identity_keypair().map_err(peerlink_crypto::HandshakeError::from)?;
//! let trust = Arc::new(MemoryTrustStore::new(LocalIdentity::new(keypair, "alice", "laptop")));
//! let transport = Box::new(RelayTransport::new("wss://relay.example/ws"));
//!
//! let (session, mut events) = spawn_session(SessionConfig::from_env(), engine, trust, transport)?;
//! session.connect("room-7").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod machine;
pub mod memory;
pub mod payload;
pub mod relay;
pub mod state;
pub mod transport;
pub mod trust;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use events::{ErrorKind, SessionEvent};
pub use health::LinkQuality;
pub use machine::{spawn_session, SessionEvents, SessionHandle};
pub use memory::{MemoryRelay, MemoryTransport};
pub use relay::RelayTransport;
pub use state::ConnectionState;
pub use transport::{Transport, TransportEvent, TransportEvents};
pub use trust::{MemoryTrustStore, TrustStore};
