use std::fmt::{Display, Formatter};

use crate::connection::connection_events::ConnectionEvent;

/// The lifecycle of a connection. `open()` moves from `Disconnected` to `Initialized`, the first
///  received packet to `Connected`, and completion of both log and parameter TOC fetches to
///  `SetupFinished`. A link error or `close()` falls back to `Disconnected` from any state.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Initialized,
    Connected,
    SetupFinished,
}

impl ConnectionState {
    /// true if packets were received from the vehicle on the current link
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::SetupFinished)
    }

    /// The events to publish when the link breaks down in this state. A link that was never
    ///  connected failed, while a connected link was lost.
    pub fn link_error_events(self, uri: &str, message: &str) -> Vec<ConnectionEvent> {
        match self {
            ConnectionState::Disconnected => vec![],
            ConnectionState::Initialized => vec![
                ConnectionEvent::ConnectionFailed { uri: uri.to_string(), message: message.to_string() },
            ],
            ConnectionState::Connected | ConnectionState::SetupFinished => vec![
                ConnectionEvent::Disconnected { uri: Some(uri.to_string()) },
                ConnectionEvent::ConnectionLost { uri: uri.to_string(), message: message.to_string() },
            ],
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Initialized => "INITIALIZED",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::SetupFinished => "SETUP_FINISHED",
        };
        write!(f, "{}", s)
    }
}
