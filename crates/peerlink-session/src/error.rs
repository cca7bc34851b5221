use peerlink_crypto::{CodecError, HandshakeError, WireError};
use thiserror::Error;

use crate::state::ConnectionState;

/// Errors returned through [`SessionHandle`](crate::SessionHandle).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport: {0}")]
    Transport(#[from] peerlink_common::Error),

    #[error("authentication: {0}")]
    Authentication(#[from] HandshakeError),

    #[error("crypto: {0}")]
    Crypto(#[from] CodecError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("send would buffer {pending} bytes, limit is {limit}")]
    BackpressureExceeded { pending: usize, limit: usize },

    #[error("gave up after {attempts} reconnect attempts")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("not connected (state {state})")]
    NotConnected { state: ConnectionState },

    #[error("operation not valid while {state}")]
    InvalidState { state: ConnectionState },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;
