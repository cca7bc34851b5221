use std::fmt;

/// Lifecycle of one logical peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Signaling,
    TransportEstablishing,
    Authenticating,
    Connected,
    Degraded,
    Reconnecting,
    /// Terminal; the session task has exited.
    Closed,
}

impl ConnectionState {
    /// A verified session with live keys.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    /// Between a join and a verified handshake.
    pub fn is_establishing(self) -> bool {
        matches!(
            self,
            Self::Signaling | Self::TransportEstablishing | Self::Authenticating
        )
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        use ConnectionState::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) | (_, Disconnected) => true,
            (Disconnected | Reconnecting, Signaling) => true,
            (Signaling, TransportEstablishing) => true,
            (Signaling | TransportEstablishing, Authenticating) => true,
            (Authenticating, Connected) => true,
            (Connected, Degraded) | (Degraded, Connected) => true,
            (Signaling | TransportEstablishing | Authenticating | Connected | Degraded, Reconnecting) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Signaling => "signaling",
            Self::TransportEstablishing => "transport_establishing",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
