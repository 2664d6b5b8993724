//! Server directory: candidate servers, the active selection, and ping / keepalive round trips.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Reserved id of the local standalone server.
pub const STANDALONE_ID: &str = "standalone";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameServer {
    pub id: String,
    pub name: String,
    pub address: ServerAddress,
    pub region: String,
    pub player_count: Option<u32>,
    pub latency: Option<Duration>,
}

impl GameServer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: ServerAddress {
                host: host.into(),
                port,
            },
            region: String::new(),
            player_count: None,
            latency: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

struct PendingPing {
    server_id: String,
    sent_at: Instant,
}

struct Inner {
    servers: BTreeMap<String, GameServer>,
    active: Option<String>,
    pending_pings: HashMap<u32, PendingPing>,
    next_ping_id: u32,
    keepalive_sent: Option<Instant>,
}

pub struct ServerDirectory {
    inner: Mutex<Inner>,
}

impl ServerDirectory {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                servers: BTreeMap::new(),
                active: None,
                pending_pings: HashMap::new(),
                next_ping_id: rand::random(),
                keepalive_sent: None,
            }),
        }
    }

    /// Insert or replace a server. Measurements of a replaced entry are kept.
    pub fn add_server(&self, mut server: GameServer) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.servers.get(&server.id) {
            server.player_count = server.player_count.or(old.player_count);
            server.latency = server.latency.or(old.latency);
        }
        inner.servers.insert(server.id.clone(), server);
    }

    /// Replace the whole list. Pending pings to removed servers are dropped.
    pub fn set_servers(&self, servers: Vec<GameServer>) {
        let mut inner = self.inner.lock();
        inner.servers = servers.into_iter().map(|s| (s.id.clone(), s)).collect();
        let Inner {
            servers,
            pending_pings,
            ..
        } = &mut *inner;
        pending_pings.retain(|_, p| servers.contains_key(&p.server_id));
    }

    pub fn server(&self, id: &str) -> Option<GameServer> {
        self.inner.lock().servers.get(id).cloned()
    }

    pub fn servers(&self) -> Vec<GameServer> {
        self.inner.lock().servers.values().cloned().collect()
    }

    pub fn set_active(&self, id: &str) {
        self.inner.lock().active = Some(id.to_string());
    }

    pub fn clear_active(&self) {
        let mut inner = self.inner.lock();
        inner.active = None;
        inner.keepalive_sent = None;
    }

    pub fn active_id(&self) -> Option<String> {
        self.inner.lock().active.clone()
    }

    pub fn active(&self) -> Option<GameServer> {
        let inner = self.inner.lock();
        inner
            .active
            .as_ref()
            .and_then(|id| inner.servers.get(id))
            .cloned()
    }

    /// Servers to probe in a ping round: everything except the active one.
    pub fn ping_targets(&self) -> Vec<GameServer> {
        let inner = self.inner.lock();
        inner
            .servers
            .values()
            .filter(|s| inner.active.as_deref() != Some(s.id.as_str()))
            .cloned()
            .collect()
    }

    /// Allocate a ping id for `server_id` and remember when it was sent.
    pub fn start_ping(&self, server_id: &str) -> u32 {
        let mut inner = self.inner.lock();
        let mut id = inner.next_ping_id;
        while inner.pending_pings.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_ping_id = id.wrapping_add(1);
        inner.pending_pings.insert(
            id,
            PendingPing {
                server_id: server_id.to_string(),
                sent_at: Instant::now(),
            },
        );
        id
    }

    /// Match a ping response. Returns false for unknown or already answered ids.
    pub fn finish_ping(&self, ping_id: u32, player_count: u32) -> bool {
        let mut inner = self.inner.lock();
        let Some(pending) = inner.pending_pings.remove(&ping_id) else {
            return false;
        };
        match inner.servers.get_mut(&pending.server_id) {
            Some(server) => {
                server.latency = Some(pending.sent_at.elapsed());
                server.player_count = Some(player_count);
                true
            }
            None => false,
        }
    }

    /// Drop pending pings older than `max_age`. Returns how many were dropped.
    pub fn expire_pings(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.pending_pings.len();
        inner.pending_pings.retain(|_, p| p.sent_at.elapsed() <= max_age);
        before - inner.pending_pings.len()
    }

    pub fn pending_ping_count(&self) -> usize {
        self.inner.lock().pending_pings.len()
    }

    /// A data-channel keepalive went out to the active server.
    pub fn start_keepalive(&self) {
        self.inner.lock().keepalive_sent = Some(Instant::now());
    }

    /// The keepalive answer arrived: update the active server's latency and player count.
    pub fn finish_keepalive(&self, player_count: u32) {
        let mut inner = self.inner.lock();
        let sent = inner.keepalive_sent.take();
        let Some(id) = inner.active.clone() else {
            return;
        };
        if let Some(server) = inner.servers.get_mut(&id) {
            server.player_count = Some(player_count);
            if let Some(sent) = sent {
                server.latency = Some(sent.elapsed());
            }
        }
    }
}

impl Default for ServerDirectory {
    fn default() -> Self {
        Self::new()
    }
}
