use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::protocol::{Packet, PacketKind};

pub type PacketCallback = Arc<dyn Fn(&Packet) + Send + Sync>;

/// Two-tier callback table keyed by packet kind. The builtin tier belongs
/// to the session itself (handshake, login, keepalive bookkeeping) and is
/// always dispatched before the user tier; user code cannot override it.
///
/// Callbacks are cloned out of the lock before being invoked, so a listener
/// may re-enter the registry (add or remove listeners) from inside its own
/// callback.
#[derive(Default)]
pub struct ListenerRegistry {
    builtin: Mutex<HashMap<PacketKind, PacketCallback>>,
    user: Mutex<HashMap<PacketKind, PacketCallback>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering two builtins for the same kind is a programmer error.
    pub fn add_builtin(&self, kind: PacketKind, callback: PacketCallback) {
        let previous = self.builtin.lock().unwrap().insert(kind, callback);
        assert!(
            previous.is_none(),
            "builtin listener already registered for kind {kind}"
        );
    }

    /// Replaces any existing user registration for the same kind.
    pub fn add(&self, kind: PacketKind, callback: PacketCallback) {
        self.user.lock().unwrap().insert(kind, callback);
    }

    pub fn remove(&self, kind: PacketKind) -> bool {
        self.user.lock().unwrap().remove(&kind).is_some()
    }

    pub fn clear_user(&self) {
        self.user.lock().unwrap().clear();
    }

    /// Runs the builtin callback (if any) to completion, then the user
    /// callback. Must only be called from the consumer thread.
    pub fn dispatch(&self, packet: &Packet) {
        let kind = packet.header.kind;

        let builtin = self.builtin.lock().unwrap().get(&kind).cloned();
        let had_builtin = builtin.is_some();
        if let Some(callback) = builtin {
            callback(packet);
        }

        let user = self.user.lock().unwrap().get(&kind).cloned();
        if let Some(callback) = user {
            callback(packet);
        } else if !had_builtin {
            log::debug!("no listener for packet kind {kind}");
        }
    }
}
