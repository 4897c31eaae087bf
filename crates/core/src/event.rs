use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::net::NetError;

/// A server entry as the surrounding application knows it (name plus
/// unresolved address). Remembered by `connect_safe` so the UI can offer a
/// retry against the same server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub address: String,
    pub port: u16,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Transport is up and the handshake has been sent.
    Connected { addr: SocketAddr },
    /// Handshake acknowledged by the server.
    Established,
    /// Identity proof accepted.
    Authenticated,
    /// The session ended for a reason other than a local `disconnect` call.
    Disconnected { reason: DisconnectReason },
    /// `connect_safe` failed to open a connection.
    ConnectionFailed {
        server: ServerDescriptor,
        error: NetError,
    },
    /// A mid-session failure tore the connection down. Pushed exactly once
    /// per failure.
    SessionError { error: NetError },
    /// A server answered a maintenance ping.
    ServerPong {
        addr: SocketAddr,
        ping_id: u32,
        player_count: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    PeerClosed,
    TransportError,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::PeerClosed => "closed by server",
            DisconnectReason::TransportError => "transport error",
        }
    }
}

/// Side-channel queue the core pushes structured events into; the UI
/// collaborator drains it once per frame. Never renders anything itself.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<SessionEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: SessionEvent) {
        self.events.lock().unwrap().push_back(event);
    }

    pub fn drain(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_drain_fifo() {
        let queue = EventQueue::new();
        queue.push(SessionEvent::Established);
        queue.push(SessionEvent::Authenticated);

        let events = queue.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SessionEvent::Established));
        assert!(matches!(events[1], SessionEvent::Authenticated));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_disconnect_reason_strings() {
        assert_eq!(DisconnectReason::Timeout.as_str(), "timed out");
        assert_eq!(DisconnectReason::PeerClosed.as_str(), "closed by server");
    }
}
