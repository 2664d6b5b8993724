//! Listener registry: per-id builtin handlers, externally owned listeners and unhandled-packet
//! rate limiting.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::codec::{Packet, PacketId};
use crate::session::SessionError;

/// Opaque identity of whoever registered a listener. The owner unregisters on its own teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerHandle(Uuid);

impl OwnerHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listener callback. Runs on the consumer context, never on an I/O thread.
pub type PacketCallback = Arc<dyn Fn(Arc<dyn Packet>) + Send + Sync>;

struct Listener {
    callback: PacketCallback,
    override_builtin: bool,
}

/// Control packets the session handles itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    HandshakeResponse,
    KeepaliveResponse,
    KeepaliveTcpResponse,
    ServerDisconnect,
    LoggedIn,
    LoginFailed,
    ServerNotice,
    ProtocolMismatch,
    Banned,
    Muted,
    RoomInvite,
    RoomInfo,
    AdminAuthSuccess,
    AdminAuthFailed,
    AdminSuccessMessage,
    AdminError,
}

/// What the dispatcher should do with one inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Builtin to run inline. `None` if there is none or a listener overrides it.
    pub builtin: Option<Builtin>,
    pub has_listeners: bool,
}

pub struct ListenerRegistry {
    listeners: Mutex<HashMap<PacketId, HashMap<OwnerHandle, Listener>>>,
    builtins: Mutex<HashMap<PacketId, Builtin>>,
    suppressed: Mutex<HashMap<PacketId, Instant>>,
    accepting: AtomicBool,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            builtins: Mutex::new(HashMap::new()),
            suppressed: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Register (or replace) the listener of `owner` for `id`.
    pub fn register_listener(
        &self,
        owner: OwnerHandle,
        id: PacketId,
        callback: PacketCallback,
        override_builtin: bool,
    ) -> Result<(), SessionError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SessionError::ListenersClosed);
        }
        self.listeners.lock().entry(id).or_default().insert(
            owner,
            Listener {
                callback,
                override_builtin,
            },
        );
        Ok(())
    }

    pub fn unregister_listener(&self, owner: OwnerHandle, id: PacketId) {
        let mut listeners = self.listeners.lock();
        if let Some(by_owner) = listeners.get_mut(&id) {
            by_owner.remove(&owner);
            if by_owner.is_empty() {
                listeners.remove(&id);
            }
        }
    }

    /// Drop every listener `owner` registered.
    pub fn unregister_owner(&self, owner: OwnerHandle) {
        self.listeners.lock().retain(|_, by_owner| {
            by_owner.remove(&owner);
            !by_owner.is_empty()
        });
    }

    /// Stop accepting registrations and drop existing listeners.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        self.listeners.lock().clear();
    }

    /// At most one builtin per id; a second registration replaces the first.
    pub fn register_builtin(&self, id: PacketId, builtin: Builtin) {
        if let Some(previous) = self.builtins.lock().insert(id, builtin) {
            tracing::debug!(id, ?previous, ?builtin, "builtin handler replaced");
        }
    }

    pub fn plan(&self, id: PacketId) -> Dispatch {
        let (has_listeners, overridden) = match self.listeners.lock().get(&id) {
            Some(by_owner) => (
                !by_owner.is_empty(),
                by_owner.values().any(|l| l.override_builtin),
            ),
            None => (false, false),
        };
        let builtin = if overridden {
            None
        } else {
            self.builtins.lock().get(&id).copied()
        };
        Dispatch {
            builtin,
            has_listeners,
        }
    }

    /// Call every listener for the packet's id. Callbacks run outside the registry lock so they
    /// may register or unregister listeners themselves.
    pub fn invoke_listeners(&self, packet: Arc<dyn Packet>) -> usize {
        let callbacks: Vec<PacketCallback> = match self.listeners.lock().get(&packet.id()) {
            Some(by_owner) => by_owner.values().map(|l| l.callback.clone()).collect(),
            None => return 0,
        };
        for callback in &callbacks {
            callback(packet.clone());
        }
        callbacks.len()
    }

    /// Silence unhandled warnings for `id` until `duration` from now.
    pub fn suppress_unhandled_for(&self, id: PacketId, duration: Duration) {
        self.suppressed.lock().insert(id, Instant::now() + duration);
    }

    /// True if an unhandled warning for `id` may be emitted now. Emitting starts a new
    /// suppression window of `cooldown`.
    pub fn should_warn_unhandled(&self, id: PacketId, cooldown: Duration) -> bool {
        let now = Instant::now();
        let mut suppressed = self.suppressed.lock();
        match suppressed.get(&id) {
            Some(until) if *until > now => false,
            _ => {
                suppressed.insert(id, now + cooldown);
                true
            }
        }
    }

    pub fn listener_count(&self, id: PacketId) -> usize {
        self.listeners.lock().get(&id).map_or(0, |m| m.len())
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
