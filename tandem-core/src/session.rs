//! Session state machine and the two I/O loop bodies.
//!
//! The output loop performs deferred connects, sends keepalives, drains the outbound queue and
//! runs ping rounds. The input loop receives one packet per iteration, runs its builtin handler
//! inline and hands listeners off to the consumer context.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::codec::{Packet, PacketId, PacketType};
use crate::context::Context;
use crate::link::Link;
use crate::listener::{Builtin, ListenerRegistry, OwnerHandle};
use crate::packet_log::PacketLog;
use crate::protocol::{
    AdminAuthFailedPacket, AdminAuthPacket, AdminAuthSuccessPacket, AdminErrorPacket,
    AdminSuccessMessagePacket, ClaimThreadPacket, CryptoHandshakeResponsePacket,
    CryptoHandshakeStartPacket, DisconnectPacket, KeepalivePacket, KeepaliveResponsePacket,
    KeepaliveTcpPacket, KeepaliveTcpResponsePacket, LoggedInPacket, LoginFailedPacket, LoginPacket,
    PingPacket, PingResponsePacket, ProtocolMismatchPacket, RoomInfoPacket, RoomInvitePacket,
    ServerBannedPacket, ServerDisconnectPacket, ServerMutedPacket, ServerNoticePacket,
    IGNORE_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use crate::servers::{GameServer, STANDALONE_ID};
use crate::transport::Transport;
use crate::worker::LoopThread;

/// Work for the output thread besides sending packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    PingServers,
}

#[derive(Debug, Clone)]
struct ConnectTarget {
    host: String,
    port: u16,
    server_id: String,
}

pub struct Session {
    ctx: Context,
    link: Link,
    listeners: Arc<ListenerRegistry>,

    handshaken: AtomicBool,
    logged_in: AtomicBool,
    suspended: AtomicBool,
    standalone: AtomicBool,
    deferred_connect: AtomicBool,
    ignore_protocol_mismatch: AtomicBool,
    admin_authorized: AtomicBool,
    admin_role: AtomicI32,
    tick_rate: AtomicU32,
    secret_key: AtomicU32,

    target: Mutex<Option<ConnectTarget>>,
    last_received: Mutex<Instant>,
    last_keepalive: Mutex<Option<Instant>>,
    last_tcp_keepalive: Mutex<Option<Instant>>,

    outbound_tx: Sender<Arc<dyn Packet>>,
    outbound_rx: Receiver<Arc<dyn Packet>>,
    tasks_tx: Sender<Task>,
    tasks_rx: Receiver<Task>,
}

impl Session {
    pub fn new(ctx: Context, transport: Arc<dyn Transport>) -> Self {
        let log = ctx.config.packet_log.as_ref().and_then(|path| {
            PacketLog::open(path)
                .map_err(|e| tracing::warn!("cannot open packet log {}: {e}", path.display()))
                .ok()
        });
        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
        let session = Self {
            ctx,
            link: Link::new(transport, log),
            listeners: Arc::new(ListenerRegistry::new()),
            handshaken: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            standalone: AtomicBool::new(false),
            deferred_connect: AtomicBool::new(false),
            ignore_protocol_mismatch: AtomicBool::new(false),
            admin_authorized: AtomicBool::new(false),
            admin_role: AtomicI32::new(0),
            tick_rate: AtomicU32::new(0),
            secret_key: AtomicU32::new(0),
            target: Mutex::new(None),
            last_received: Mutex::new(Instant::now()),
            last_keepalive: Mutex::new(None),
            last_tcp_keepalive: Mutex::new(None),
            outbound_tx,
            outbound_rx,
            tasks_tx,
            tasks_rx,
        };
        session.register_builtins();
        session
    }

    fn register_builtins(&self) {
        let table = [
            (CryptoHandshakeResponsePacket::ID, Builtin::HandshakeResponse),
            (KeepaliveResponsePacket::ID, Builtin::KeepaliveResponse),
            (KeepaliveTcpResponsePacket::ID, Builtin::KeepaliveTcpResponse),
            (ServerDisconnectPacket::ID, Builtin::ServerDisconnect),
            (LoggedInPacket::ID, Builtin::LoggedIn),
            (LoginFailedPacket::ID, Builtin::LoginFailed),
            (ServerNoticePacket::ID, Builtin::ServerNotice),
            (ProtocolMismatchPacket::ID, Builtin::ProtocolMismatch),
            (ServerBannedPacket::ID, Builtin::Banned),
            (ServerMutedPacket::ID, Builtin::Muted),
            (RoomInvitePacket::ID, Builtin::RoomInvite),
            (RoomInfoPacket::ID, Builtin::RoomInfo),
            (AdminAuthSuccessPacket::ID, Builtin::AdminAuthSuccess),
            (AdminAuthFailedPacket::ID, Builtin::AdminAuthFailed),
            (AdminSuccessMessagePacket::ID, Builtin::AdminSuccessMessage),
            (AdminErrorPacket::ID, Builtin::AdminError),
        ];
        for (id, builtin) in table {
            self.listeners.register_builtin(id, builtin);
        }
    }

    // connection lifecycle

    /// Record a connect intent for the output thread. Returns before any socket work.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        server_id: &str,
        standalone: bool,
    ) -> Result<(), SessionError> {
        // held until the intent is recorded so concurrent callers see each other
        let mut pending = self.target.lock();
        if self.deferred_connect.load(Ordering::SeqCst) || (self.connected() && !self.handshaken()) {
            return Err(SessionError::AlreadyConnecting);
        }
        if !standalone && self.ctx.account.auth_token().is_empty() {
            return Err(SessionError::MissingAuthToken);
        }
        if self.connected() {
            self.disconnect(false, false);
        }

        self.standalone.store(standalone, Ordering::SeqCst);
        *self.last_received.lock() = Instant::now();
        *self.last_keepalive.lock() = None;
        *self.last_tcp_keepalive.lock() = None;

        let previous = self.secret_key.load(Ordering::SeqCst);
        let mut key: u32 = rand::random();
        while key == previous {
            key = rand::random();
        }
        self.secret_key.store(key, Ordering::SeqCst);

        *pending = Some(ConnectTarget {
            host: host.to_string(),
            port,
            server_id: server_id.to_string(),
        });
        self.deferred_connect.store(true, Ordering::SeqCst);
        drop(pending);
        tracing::info!(server = server_id, "connecting to {host}:{port}");
        Ok(())
    }

    /// Connect to a server from the directory.
    pub fn connect_to(&self, server_id: &str) -> Result<(), SessionError> {
        let server = self.lookup(server_id)?;
        self.connect(&server.address.host, server.address.port, &server.id, false)
    }

    /// Connect to the local standalone server. No auth token needed.
    pub fn connect_standalone(&self) -> Result<(), SessionError> {
        let server = self.lookup(STANDALONE_ID)?;
        self.connect(&server.address.host, server.address.port, STANDALONE_ID, true)
    }

    fn lookup(&self, server_id: &str) -> Result<GameServer, SessionError> {
        self.ctx
            .servers
            .server(server_id)
            .ok_or_else(|| SessionError::UnknownServer(server_id.to_string()))
    }

    /// Tear the session down. `quiet` skips the disconnect notice; `no_clear` keeps the active
    /// server selected. A no-op for the socket when not connected.
    pub fn disconnect(&self, quiet: bool, no_clear: bool) {
        if let Err(e) = self.try_disconnect(quiet, no_clear) {
            tracing::warn!("disconnect notice failed: {e}");
            let _ = self.try_disconnect(true, no_clear);
        }
    }

    fn try_disconnect(&self, quiet: bool, no_clear: bool) -> Result<(), crate::link::LinkError> {
        self.handshaken.store(false, Ordering::SeqCst);
        self.logged_in.store(false, Ordering::SeqCst);
        self.standalone.store(false, Ordering::SeqCst);
        self.deferred_connect.store(false, Ordering::SeqCst);
        self.clear_admin_status();

        if !self.connected() {
            return Ok(());
        }
        if !quiet {
            // bypass the queue so the notice goes out before the close
            self.link.send_packet(&DisconnectPacket)?;
        }
        self.link.close();
        let dropped = self.outbound_rx.try_iter().count();
        tracing::info!(dropped, "disconnected");

        if !no_clear {
            self.ctx.servers.clear_active();
            let observer = Arc::clone(&self.ctx.observer);
            self.ctx.main_queue.queue(move || observer.on_disconnected());
        }
        Ok(())
    }

    /// Report `message` as the disconnect reason and disconnect.
    pub fn disconnect_with_message(&self, message: &str, quiet: bool) {
        self.ctx.errors.error(format!(
            "You have been disconnected from the active server.\n\nReason: {message}"
        ));
        self.disconnect(quiet, false);
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    /// Let the next handshake skip the server's protocol check.
    pub fn set_ignore_protocol_mismatch(&self, ignore: bool) {
        self.ignore_protocol_mismatch.store(ignore, Ordering::SeqCst);
    }

    /// Protocol version the next handshake will carry.
    pub fn used_protocol(&self) -> u16 {
        if self.ignore_protocol_mismatch.load(Ordering::SeqCst) {
            IGNORE_PROTOCOL_VERSION
        } else {
            PROTOCOL_VERSION
        }
    }

    fn clear_admin_status(&self) {
        self.admin_authorized.store(false, Ordering::SeqCst);
        self.admin_role.store(0, Ordering::SeqCst);
    }

    // sending

    /// Queue a packet for the active server. Only allowed once logged in.
    pub fn send<P: Packet>(&self, packet: P) -> Result<(), SessionError> {
        if !self.connected() {
            return Err(SessionError::NotConnected);
        }
        if !self.established() {
            return Err(SessionError::NotLoggedIn);
        }
        self.enqueue(Arc::new(packet));
        Ok(())
    }

    fn enqueue(&self, packet: Arc<dyn Packet>) {
        // the receiver lives in self
        let _ = self.outbound_tx.send(packet);
    }

    /// Ask the output thread to probe every server except the active one.
    pub fn ping_servers(&self) {
        let _ = self.tasks_tx.send(Task::PingServers);
    }

    // listeners

    pub fn register_listener<F>(
        &self,
        owner: OwnerHandle,
        id: PacketId,
        callback: F,
        override_builtin: bool,
    ) -> Result<(), SessionError>
    where
        F: Fn(Arc<dyn Packet>) + Send + Sync + 'static,
    {
        self.listeners
            .register_listener(owner, id, Arc::new(callback), override_builtin)
    }

    /// Typed listener for `T::ID`.
    pub fn listen<T, F>(&self, owner: OwnerHandle, callback: F, override_builtin: bool) -> Result<(), SessionError>
    where
        T: PacketType,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register_listener(
            owner,
            T::ID,
            move |packet: Arc<dyn Packet>| {
                if let Some(payload) = packet.downcast_ref::<T>() {
                    callback(payload);
                }
            },
            override_builtin,
        )
    }

    pub fn unregister_listener(&self, owner: OwnerHandle, id: PacketId) {
        self.listeners.unregister_listener(owner, id);
    }

    pub fn unregister_owner(&self, owner: OwnerHandle) {
        self.listeners.unregister_owner(owner);
    }

    pub fn suppress_unhandled_for(&self, id: PacketId, duration: Duration) {
        self.listeners.suppress_unhandled_for(id, duration);
    }

    /// Decode `T` instead of delivering its id as a raw packet.
    pub fn register_packet<T: PacketType>(&self) {
        self.link.register_packet::<T>();
    }

    // queries

    pub fn connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn handshaken(&self) -> bool {
        self.handshaken.load(Ordering::SeqCst)
    }

    /// Logged in.
    pub fn established(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub fn standalone(&self) -> bool {
        self.standalone.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn is_authorized_admin(&self) -> bool {
        self.admin_authorized.load(Ordering::SeqCst)
    }

    pub fn admin_role(&self) -> i32 {
        self.admin_role.load(Ordering::SeqCst)
    }

    /// Server tick rate from the last login.
    pub fn tick_rate(&self) -> u32 {
        self.tick_rate.load(Ordering::SeqCst)
    }

    pub fn secret_key(&self) -> u32 {
        self.secret_key.load(Ordering::SeqCst)
    }

    pub fn active_server(&self) -> Option<GameServer> {
        self.ctx.servers.active()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    // output loop

    pub fn output_iteration(&self) {
        let cfg = &self.ctx.config;
        if self.is_suspended() {
            std::thread::sleep(cfg.suspended_output_sleep());
            return;
        }

        if self.deferred_connect.load(Ordering::SeqCst) && !self.run_deferred_connect() {
            return;
        }

        self.maybe_send_keepalive();

        // one bounded wait, then only what was queued by then
        let mut next = self.outbound_rx.recv_timeout(cfg.queue_poll()).ok();
        let mut backlog = self.outbound_rx.len();
        while let Some(packet) = next {
            if !self.connected() {
                tracing::debug!(id = packet.id(), "not connected, dropping queued packet");
            } else if let Err(e) = self.link.send_packet(packet.as_ref()) {
                tracing::debug!(id = packet.id(), "failed to send packet: {e}");
                self.disconnect_with_message(&e.to_string(), false);
                return;
            }
            if self.is_suspended() || backlog == 0 {
                break;
            }
            backlog -= 1;
            next = self.outbound_rx.try_recv().ok();
        }

        while let Ok(task) = self.tasks_rx.try_recv() {
            match task {
                Task::PingServers => self.run_ping_round(),
            }
        }

        std::thread::yield_now();
    }

    /// Returns false if the connect failed.
    fn run_deferred_connect(&self) -> bool {
        let target = self.target.lock().clone();
        let Some(target) = target else {
            self.deferred_connect.store(false, Ordering::SeqCst);
            return true;
        };
        let result = self
            .link
            .connect(&target.host, target.port, self.ctx.config.connect_timeout());
        self.deferred_connect.store(false, Ordering::SeqCst);

        if let Err(e) = result {
            self.disconnect(true, false);
            self.ctx.errors.error(format!("Failed to connect: {e}"));
            return false;
        }

        tracing::debug!("control stream up, sending handshake");
        self.ctx.servers.set_active(&target.server_id);
        self.link.generate_keys();
        match self.link.public_key() {
            Ok(key) => {
                self.enqueue(Arc::new(CryptoHandshakeStartPacket {
                    protocol: self.used_protocol(),
                    key,
                }));
                true
            }
            Err(e) => {
                self.disconnect(true, false);
                self.ctx.errors.error(format!("Failed to connect: {e}"));
                false
            }
        }
    }

    fn maybe_send_keepalive(&self) {
        if !self.established() {
            return;
        }
        let cfg = &self.ctx.config;
        let now = Instant::now();

        if interval_elapsed(&self.last_keepalive, now, cfg.keepalive_interval()) {
            self.enqueue(Arc::new(KeepalivePacket));
            self.ctx.servers.start_keepalive();
        }
        // NAT binding only
        if interval_elapsed(&self.last_tcp_keepalive, now, cfg.tcp_keepalive_interval()) {
            self.enqueue(Arc::new(KeepaliveTcpPacket));
        }
    }

    fn run_ping_round(&self) {
        let servers = &self.ctx.servers;
        let expired = servers.expire_pings(self.ctx.config.ping_timeout());
        if expired > 0 {
            tracing::debug!(expired, "dropped unanswered pings");
        }
        for server in servers.ping_targets() {
            let ping_id = servers.start_ping(&server.id);
            let ping = PingPacket { ping_id };
            if let Err(e) = self
                .link
                .send_packet_to(&ping, &server.address.host, server.address.port)
            {
                self.ctx
                    .errors
                    .warn(format!("Failed to ping {}: {e}", server.name));
            }
        }
    }

    // input loop

    pub fn input_iteration(&self) {
        let cfg = &self.ctx.config;
        if self.is_suspended() || self.deferred_connect.load(Ordering::SeqCst) {
            std::thread::sleep(cfg.suspended_input_sleep());
            return;
        }

        let inbound = match self.link.recv_packet(cfg.recv_poll()) {
            Ok(Some(inbound)) => inbound,
            Ok(None) => {
                self.maybe_disconnect_if_dead();
                return;
            }
            Err(e) => {
                self.ctx
                    .errors
                    .debug_warn(format!("failed to receive a packet: {e}"));
                if self.connected() {
                    self.disconnect_with_message(&e.to_string(), true);
                }
                return;
            }
        };

        if let Some(response) = inbound.packet.downcast_ref::<PingResponsePacket>() {
            self.ctx
                .servers
                .finish_ping(response.ping_id, response.player_count);
            return;
        }
        if !inbound.from_active() {
            tracing::debug!(id = inbound.packet.id(), origin = ?inbound.origin, "ignoring packet from inactive server");
            return;
        }

        *self.last_received.lock() = Instant::now();
        self.dispatch(inbound.packet);
    }

    fn maybe_disconnect_if_dead(&self) {
        if !self.connected() {
            return;
        }
        let cfg = &self.ctx.config;
        let elapsed = self.last_received.lock().elapsed();

        if !self.handshaken() && elapsed > cfg.handshake_timeout() {
            self.ctx.errors.error(format!(
                "Failed to connect to the server. No response was received after {} seconds.",
                cfg.handshake_timeout().as_secs_f32()
            ));
            self.disconnect(true, false);
        } else if elapsed > cfg.disconnect_after() {
            self.ctx.errors.error(
                "The server you were connected to is not responding to any requests. You have been disconnected.",
            );
            self.disconnect(false, false);
        }
    }

    fn dispatch(&self, packet: Arc<dyn Packet>) {
        let id = packet.id();
        let plan = self.listeners.plan(id);

        if let Some(builtin) = plan.builtin {
            self.run_builtin(builtin, packet.as_ref());
        }

        if plan.has_listeners {
            let listeners = Arc::clone(&self.listeners);
            self.ctx.main_queue.queue(move || {
                listeners.invoke_listeners(packet);
            });
        } else if plan.builtin.is_none()
            && self
                .listeners
                .should_warn_unhandled(id, self.ctx.config.unhandled_cooldown())
        {
            self.ctx.errors.debug_warn(format!("Unhandled packet: {id}"));
        }
    }

    fn run_builtin(&self, builtin: Builtin, packet: &dyn Packet) {
        let errors = &self.ctx.errors;
        match builtin {
            Builtin::HandshakeResponse => {
                if let Some(p) = packet.downcast_ref::<CryptoHandshakeResponsePacket>() {
                    self.complete_handshake(p);
                }
            }
            Builtin::KeepaliveResponse => {
                if let Some(p) = packet.downcast_ref::<KeepaliveResponsePacket>() {
                    self.ctx.servers.finish_keepalive(p.player_count);
                }
            }
            Builtin::KeepaliveTcpResponse => {}
            Builtin::ServerDisconnect => {
                if let Some(p) = packet.downcast_ref::<ServerDisconnectPacket>() {
                    self.disconnect_with_message(&p.message, false);
                }
            }
            Builtin::LoggedIn => {
                if let Some(p) = packet.downcast_ref::<LoggedInPacket>() {
                    self.complete_login(p);
                }
            }
            Builtin::LoginFailed => {
                if let Some(p) = packet.downcast_ref::<LoginFailedPacket>() {
                    errors.error(format!(
                        "Authentication failed! The server rejected the login attempt.\n\nReason: {}",
                        p.message
                    ));
                    self.ctx.account.clear_auth_token();
                    self.disconnect(true, false);
                }
            }
            Builtin::ServerNotice => {
                if let Some(p) = packet.downcast_ref::<ServerNoticePacket>() {
                    errors.notice(p.message.clone());
                }
            }
            Builtin::ProtocolMismatch => {
                if let Some(p) = packet.downcast_ref::<ProtocolMismatchPacket>() {
                    self.handle_protocol_mismatch(p.server_protocol);
                }
            }
            Builtin::Banned => {
                if let Some(p) = packet.downcast_ref::<ServerBannedPacket>() {
                    errors.error(ban_message(&p.message, p.timestamp));
                    self.disconnect(false, false);
                }
            }
            Builtin::Muted => {
                if let Some(p) = packet.downcast_ref::<ServerMutedPacket>() {
                    errors.warn(mute_message(&p.reason, p.timestamp));
                }
            }
            Builtin::RoomInvite => {
                if let Some(p) = packet.downcast_ref::<RoomInvitePacket>() {
                    let observer = Arc::clone(&self.ctx.observer);
                    let (room_id, inviter) = (p.room_id, p.inviter.clone());
                    self.ctx
                        .main_queue
                        .queue(move || observer.on_room_invite(room_id, inviter));
                }
            }
            Builtin::RoomInfo => {
                if let Some(p) = packet.downcast_ref::<RoomInfoPacket>() {
                    errors.success("Room configuration updated");
                    let observer = Arc::clone(&self.ctx.observer);
                    let info = p.info.clone();
                    self.ctx.main_queue.queue(move || observer.on_room_info(info));
                }
            }
            Builtin::AdminAuthSuccess => {
                if let Some(p) = packet.downcast_ref::<AdminAuthSuccessPacket>() {
                    self.admin_authorized.store(true, Ordering::SeqCst);
                    self.admin_role.store(p.role, Ordering::SeqCst);
                    errors.success("Successfully authorized");
                }
            }
            Builtin::AdminAuthFailed => {
                errors.warn("Login failed");
                self.ctx.account.clear_admin_password();
            }
            Builtin::AdminSuccessMessage => {
                if let Some(p) = packet.downcast_ref::<AdminSuccessMessagePacket>() {
                    errors.success(p.message.clone());
                }
            }
            Builtin::AdminError => {
                if let Some(p) = packet.downcast_ref::<AdminErrorPacket>() {
                    errors.warn(p.message.clone());
                }
            }
        }
    }

    /// Derive the box key and queue the login. Nothing else is queued for the server until the
    /// login is answered.
    fn complete_handshake(&self, response: &CryptoHandshakeResponsePacket) {
        if let Err(e) = self.link.set_peer_key(&response.key) {
            self.ctx.errors.error(format!("Handshake failed: {e}"));
            self.disconnect(true, false);
            return;
        }
        self.handshaken.store(true, Ordering::SeqCst);
        tracing::debug!("handshake complete, logging in");

        let token = if self.standalone() {
            String::new()
        } else {
            self.ctx.account.auth_token()
        };
        let account = self.ctx.account.snapshot();
        self.enqueue(Arc::new(LoginPacket {
            secret_key: self.secret_key(),
            account_id: account.account_id,
            user_id: account.user_id,
            account_name: account.account_name,
            token,
            profile: account.profile,
            fragmentation_limit: self.ctx.config.effective_fragmentation_limit(),
        }));
    }

    fn complete_login(&self, packet: &LoggedInPacket) {
        tracing::info!(tps = packet.tps, "logged in");
        self.tick_rate.store(packet.tps, Ordering::SeqCst);
        self.logged_in.store(true, Ordering::SeqCst);

        let observer = Arc::clone(&self.ctx.observer);
        let special = packet.special_user_data.clone();
        self.ctx.main_queue.queue(move || observer.on_logged_in(special));

        // lets the server tie the datagram flow to this session
        self.enqueue(Arc::new(ClaimThreadPacket {
            secret_key: self.secret_key(),
        }));

        if let Some(password) = self.ctx.account.admin_password() {
            self.enqueue(Arc::new(AdminAuthPacket { password }));
        }
    }

    fn handle_protocol_mismatch(&self, server_protocol: u16) {
        tracing::warn!(
            server = server_protocol,
            client = PROTOCOL_VERSION,
            "protocol mismatch"
        );
        let override_allowed = self.ctx.config.allow_protocol_override;
        if !override_allowed {
            let message = if server_protocol < PROTOCOL_VERSION {
                "Your client version is too new for this server. Downgrade the client or ask the server owner to update their server."
            } else {
                "Your client version is outdated, please update in order to connect."
            };
            self.ctx.errors.error(message);
        }
        let observer = Arc::clone(&self.ctx.observer);
        self.ctx.main_queue.queue(move || {
            observer.on_protocol_mismatch(server_protocol, PROTOCOL_VERSION, override_allowed)
        });
        self.disconnect(true, false);
    }
}

fn interval_elapsed(last: &Mutex<Option<Instant>>, now: Instant, interval: Duration) -> bool {
    let mut last = last.lock();
    match *last {
        Some(at) if now.duration_since(at) <= interval => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

fn expiry(timestamp: i64) -> Option<String> {
    if timestamp <= 0 {
        return None;
    }
    chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
}

fn ban_message(message: &str, timestamp: i64) -> String {
    match expiry(timestamp) {
        Some(until) => format!("You are banned from this server until {until}.\n\nReason: {message}"),
        None => format!("You are permanently banned from this server.\n\nReason: {message}"),
    }
}

fn mute_message(reason: &str, timestamp: i64) -> String {
    match expiry(timestamp) {
        Some(until) => format!("You have been muted until {until}.\n\nReason: {reason}"),
        None => format!("You have been permanently muted.\n\nReason: {reason}"),
    }
}

/// Owns the session and its output and input threads.
pub struct SessionManager {
    session: Arc<Session>,
    output: Option<LoopThread>,
    input: Option<LoopThread>,
}

impl SessionManager {
    pub fn start(ctx: Context, transport: Arc<dyn Transport>) -> Result<Self, SessionError> {
        let session = Arc::new(Session::new(ctx, transport));

        let out = Arc::clone(&session);
        let output = LoopThread::spawn("tandem-out", move || out.output_iteration())
            .map_err(SessionError::Spawn)?;
        let inp = Arc::clone(&session);
        let input = LoopThread::spawn("tandem-in", move || inp.input_iteration())
            .map_err(SessionError::Spawn)?;

        tracing::info!("session threads started");
        Ok(Self {
            session,
            output: Some(output),
            input: Some(input),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Close the listener registry, stop both threads, then say goodbye to the server.
    pub fn shutdown(&mut self) {
        if self.output.is_none() && self.input.is_none() {
            return;
        }
        self.session.listeners.close();

        tracing::debug!("waiting for output thread");
        if let Some(mut output) = self.output.take() {
            output.stop_and_wait();
        }
        tracing::debug!("waiting for input thread");
        if let Some(mut input) = self.input.take() {
            input.stop_and_wait();
        }

        if self.session.connected() {
            self.session.disconnect(false, true);
        }
        tracing::info!("session shut down");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Precondition failures returned to the caller. Network and protocol failures go to the error
/// sink instead.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("already trying to connect, please wait")]
    AlreadyConnecting,
    #[error("no auth token set")]
    MissingAuthToken,
    #[error("not connected to a server")]
    NotConnected,
    #[error("not logged in yet")]
    NotLoggedIn,
    #[error("unknown server {0:?}")]
    UnknownServer(String),
    #[error("listener registry is closed")]
    ListenersClosed,
    #[error("failed to start session thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountProvider, AccountSnapshot, AccountStore};
    use crate::codec::RawPacket;
    use crate::config::SessionConfig;
    use crate::main_queue::MainQueue;
    use crate::observer::SessionObserver;
    use crate::protocol::{PlayerPreview, PlayerProfile, RoomInfo, SpecialUserData};
    use crate::servers::ServerDirectory;
    use crate::sink::{ErrorQueues, ErrorSink, Severity};
    use crate::testing::{FakeServer, MemoryTransport};
    use crate::transport::TransportError;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl SessionObserver for RecordingObserver {
        fn on_logged_in(&self, special: Option<SpecialUserData>) {
            self.events
                .lock()
                .push(format!("logged_in:{}", special.and_then(|s| s.badge).unwrap_or_default()));
        }

        fn on_room_invite(&self, room_id: u32, inviter: PlayerPreview) {
            self.events
                .lock()
                .push(format!("invite:{room_id}:{}", inviter.name));
        }

        fn on_room_info(&self, info: RoomInfo) {
            self.events.lock().push(format!("room:{}", info.name));
        }

        fn on_protocol_mismatch(&self, server: u16, client: u16, override_allowed: bool) {
            self.events
                .lock()
                .push(format!("mismatch:{server}:{client}:{override_allowed}"));
        }

        fn on_disconnected(&self) {
            self.events.lock().push("disconnected".into());
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            queue_poll_ms: 1,
            recv_poll_ms: 1,
            suspended_output_sleep_ms: 1,
            suspended_input_sleep_ms: 1,
            ..Default::default()
        }
    }

    struct Harness {
        session: Session,
        transport: Arc<MemoryTransport>,
        errors: Arc<ErrorQueues>,
        account: Arc<AccountStore>,
        servers: Arc<ServerDirectory>,
        observer: Arc<RecordingObserver>,
        main_queue: MainQueue,
        server: FakeServer,
    }

    fn harness_with(config: SessionConfig) -> Harness {
        let servers = Arc::new(ServerDirectory::new());
        servers.add_server(GameServer::new("a", "Alpha", "a.example", 4201));
        servers.add_server(GameServer::new("b", "Beta", "b.example", 4202));
        servers.add_server(GameServer::new(STANDALONE_ID, "Local", "127.0.0.1", 4200));

        let account = Arc::new(AccountStore::new(AccountSnapshot {
            account_id: 1001,
            user_id: 77,
            account_name: "pilot".into(),
            profile: PlayerProfile {
                icon_id: 3,
                ..Default::default()
            },
        }));
        account.set_auth_token("token-abc");

        let errors = Arc::new(ErrorQueues::new(true));
        let observer = Arc::new(RecordingObserver::default());
        let ctx = Context::new(config, servers.clone(), account.clone(), errors.clone())
            .with_observer(observer.clone());
        let main_queue = ctx.main_queue.clone();
        let transport = Arc::new(MemoryTransport::new());
        let session = Session::new(ctx, transport.clone());

        Harness {
            session,
            transport,
            errors,
            account,
            servers,
            observer,
            main_queue,
            server: FakeServer::new(),
        }
    }

    fn harness() -> Harness {
        harness_with(fast_config())
    }

    impl Harness {
        /// Connect to "a" and flush the handshake start. Returns the frames sent.
        fn connect(&self) -> Vec<Arc<dyn Packet>> {
            self.session.connect_to("a").unwrap();
            self.session.output_iteration();
            self.server.decode_all(&self.transport.take_sent())
        }

        fn handshake(&mut self) -> Vec<Arc<dyn Packet>> {
            let sent = self.connect();
            let start = sent[0]
                .downcast_ref::<CryptoHandshakeStartPacket>()
                .unwrap();
            self.server.accept_key(&start.key);
            self.receive(&CryptoHandshakeResponsePacket {
                key: self.server.public_key(),
            });
            self.session.output_iteration();
            self.server.decode_all(&self.transport.take_sent())
        }

        fn login(&mut self) -> Vec<Arc<dyn Packet>> {
            self.handshake();
            self.receive(&LoggedInPacket {
                tps: 30,
                special_user_data: None,
            });
            self.session.output_iteration();
            self.server.decode_all(&self.transport.take_sent())
        }

        fn receive(&self, packet: &dyn Packet) {
            self.transport.push_active(self.server.frame(packet));
            self.session.input_iteration();
        }

        fn sent_ids(&self) -> Vec<PacketId> {
            self.server
                .decode_all(&self.transport.sent())
                .iter()
                .map(|p| p.id())
                .collect()
        }
    }

    #[test]
    fn connect_while_pending_is_rejected() {
        let h = harness();
        h.session.connect_to("a").unwrap();
        let key = h.session.secret_key();

        assert!(matches!(
            h.session.connect_to("b"),
            Err(SessionError::AlreadyConnecting)
        ));
        assert_eq!(h.session.secret_key(), key);

        h.session.output_iteration();
        assert_eq!(h.transport.connects(), vec![("a.example".to_string(), 4201)]);
        assert_eq!(h.servers.active_id().as_deref(), Some("a"));

        // connected but not handshaken counts as still connecting
        assert!(matches!(
            h.session.connect_to("b"),
            Err(SessionError::AlreadyConnecting)
        ));
    }

    #[test]
    fn missing_token_fails_before_any_socket_work() {
        let h = harness();
        h.account.set_auth_token("");
        assert!(matches!(
            h.session.connect_to("a"),
            Err(SessionError::MissingAuthToken)
        ));
        h.session.output_iteration();
        assert!(h.transport.connects().is_empty());

        h.session.connect_standalone().unwrap();
        assert!(h.session.standalone());
        h.session.output_iteration();
        assert_eq!(h.transport.connects(), vec![("127.0.0.1".to_string(), 4200)]);
    }

    #[test]
    fn unknown_server_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.session.connect_to("nowhere"),
            Err(SessionError::UnknownServer(id)) if id == "nowhere"
        ));
    }

    #[test]
    fn secret_key_changes_per_connect() {
        let mut h = harness();
        h.login();
        let first = h.session.secret_key();
        h.session.connect_to("b").unwrap();
        assert!(!h.session.connected());
        assert_ne!(h.session.secret_key(), first);
    }

    #[test]
    fn handshake_is_followed_by_exactly_one_login() {
        let mut h = harness();
        let sent = h.connect();
        assert_eq!(sent.len(), 1);
        let start = sent[0]
            .downcast_ref::<CryptoHandshakeStartPacket>()
            .unwrap();
        assert_eq!(start.protocol, 7);
        let client_key = start.key.clone();

        h.server.accept_key(&client_key);
        h.receive(&CryptoHandshakeResponsePacket {
            key: h.server.public_key(),
        });
        assert!(h.session.handshaken());
        assert!(!h.session.established());

        h.session.output_iteration();
        let frames = h.transport.take_sent();
        assert_eq!(frames.len(), 1);
        let (frame, _) = crate::wire::decode_frame(&frames[0].bytes).unwrap();
        assert!(frame.encrypted);

        let packet = h.server.decode(&frames[0].bytes).unwrap();
        let login = packet.downcast_ref::<LoginPacket>().unwrap();
        assert_eq!(login.secret_key, h.session.secret_key());
        assert_eq!(login.account_id, 1001);
        assert_eq!(login.user_id, 77);
        assert_eq!(login.account_name, "pilot");
        assert_eq!(login.token, "token-abc");
        assert_eq!(login.profile.icon_id, 3);
        assert_eq!(login.fragmentation_limit, 65000);
    }

    #[test]
    fn logged_in_claims_data_channel_and_reauthorizes_admin() {
        let mut h = harness();
        h.account.set_admin_password(Some("hunter2".into()));
        h.handshake();
        h.receive(&LoggedInPacket {
            tps: 30,
            special_user_data: Some(SpecialUserData {
                name_color: None,
                badge: Some("mod".into()),
            }),
        });
        assert!(h.session.established());
        assert_eq!(h.session.tick_rate(), 30);

        h.session.output_iteration();
        let sent = h.server.decode_all(&h.transport.take_sent());
        let claim = sent[0].downcast_ref::<ClaimThreadPacket>().unwrap();
        assert_eq!(claim.secret_key, h.session.secret_key());
        let auth = sent[1].downcast_ref::<AdminAuthPacket>().unwrap();
        assert_eq!(auth.password, "hunter2");
        // first keepalives go out right after login
        assert!(sent[2].is::<KeepalivePacket>());
        assert!(sent[3].is::<KeepaliveTcpPacket>());

        h.main_queue.drain();
        assert_eq!(h.observer.events(), vec!["logged_in:mod".to_string()]);

        h.receive(&AdminAuthSuccessPacket { role: 2 });
        assert!(h.session.is_authorized_admin());
        assert_eq!(h.session.admin_role(), 2);
        assert_eq!(h.errors.count(Severity::Success), 1);

        h.session.disconnect(true, false);
        assert!(!h.session.is_authorized_admin());
        assert_eq!(h.session.admin_role(), 0);
    }

    #[test]
    fn rejected_admin_password_is_cleared() {
        let mut h = harness();
        h.account.set_admin_password(Some("wrong".into()));
        h.login();
        h.receive(&AdminAuthFailedPacket);
        assert!(h.account.admin_password().is_none());
        assert_eq!(h.errors.count(Severity::Warning), 1);
        assert!(!h.session.is_authorized_admin());
    }

    #[test]
    fn standalone_login_sends_empty_token() {
        let mut h = harness();
        h.session.connect_standalone().unwrap();
        h.session.output_iteration();
        let sent = h.server.decode_all(&h.transport.take_sent());
        let start = sent[0]
            .downcast_ref::<CryptoHandshakeStartPacket>()
            .unwrap();
        h.server.accept_key(&start.key);
        h.receive(&CryptoHandshakeResponsePacket {
            key: h.server.public_key(),
        });
        h.session.output_iteration();
        let sent = h.server.decode_all(&h.transport.take_sent());
        assert_eq!(sent[0].downcast_ref::<LoginPacket>().unwrap().token, "");
    }

    #[test]
    fn dead_server_reports_exactly_one_error() {
        let mut h = harness_with(SessionConfig {
            disconnect_after_ms: 30,
            ..fast_config()
        });
        h.login();
        h.errors.drain();
        std::thread::sleep(Duration::from_millis(60));

        h.session.input_iteration();
        assert!(!h.session.connected());
        assert_eq!(h.errors.count(Severity::Error), 1);
        // non-quiet: the server is told
        assert_eq!(h.sent_ids(), vec![DisconnectPacket::ID]);

        h.session.input_iteration();
        assert_eq!(h.errors.count(Severity::Error), 1);
        assert_eq!(h.servers.active_id(), None);
        h.main_queue.drain();
        assert_eq!(
            h.observer.events().last().map(String::as_str),
            Some("disconnected")
        );
    }

    #[test]
    fn handshake_timeout_disconnects_quietly() {
        let h = harness_with(SessionConfig {
            handshake_timeout_ms: 20,
            ..fast_config()
        });
        h.connect();
        h.session.input_iteration();
        assert!(h.session.connected());

        std::thread::sleep(Duration::from_millis(40));
        h.session.input_iteration();
        assert!(!h.session.connected());
        let reports = h.errors.drain();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.contains("No response"));
        assert!(h.transport.sent().is_empty());
    }

    #[test]
    fn override_listener_suppresses_builtin() {
        let mut h = harness();
        h.login();
        h.errors.drain();

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let owner = OwnerHandle::new();
        h.session
            .listen::<ServerNoticePacket, _>(
                owner,
                move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                },
                true,
            )
            .unwrap();

        h.receive(&ServerNoticePacket {
            message: "first".into(),
        });
        assert_eq!(h.errors.count(Severity::Notice), 0);
        // listeners run on the consumer context, not inline
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        h.main_queue.drain();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        h.session.unregister_listener(owner, ServerNoticePacket::ID);
        let c = calls.clone();
        h.session
            .listen::<ServerNoticePacket, _>(
                OwnerHandle::new(),
                move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                },
                false,
            )
            .unwrap();
        h.receive(&ServerNoticePacket {
            message: "second".into(),
        });
        assert_eq!(h.errors.count(Severity::Notice), 1);
        h.main_queue.drain();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unhandled_packets_warn_once_per_window() {
        let mut h = harness();
        h.login();
        h.errors.drain();

        let unknown = RawPacket {
            id: 21_999,
            body: vec![1, 2],
        };
        h.receive(&unknown);
        h.receive(&unknown);
        assert_eq!(h.errors.count(Severity::DebugWarning), 1);

        h.session
            .suppress_unhandled_for(21_998, Duration::from_secs(60));
        h.receive(&RawPacket {
            id: 21_998,
            body: vec![],
        });
        assert_eq!(h.errors.count(Severity::DebugWarning), 1);
        assert!(h.session.connected());
    }

    #[test]
    fn raw_packets_reach_listeners() {
        let mut h = harness();
        h.login();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        h.session
            .register_listener(
                OwnerHandle::new(),
                21_999,
                move |p| {
                    let raw = p.as_any().downcast_ref::<RawPacket>().unwrap();
                    s.lock().push(raw.body.clone());
                },
                false,
            )
            .unwrap();
        h.receive(&RawPacket {
            id: 21_999,
            body: vec![9],
        });
        h.main_queue.drain();
        assert_eq!(*seen.lock(), vec![vec![9u8]]);
        assert_eq!(h.errors.count(Severity::DebugWarning), 0);
    }

    #[test]
    fn ping_response_updates_only_matching_server() {
        let h = harness();
        h.session.ping_servers();
        h.session.output_iteration();

        let sent = h.transport.take_sent();
        assert_eq!(sent.len(), 3);
        let ping_to = |host: &str| {
            let s = sent
                .iter()
                .find(|s| s.to.as_ref().map(|(name, _)| name.as_str()) == Some(host))
                .unwrap();
            h.server
                .decode(&s.bytes)
                .unwrap()
                .downcast_ref::<PingPacket>()
                .unwrap()
                .ping_id
        };
        let id_a = ping_to("a.example");

        let from: SocketAddr = "10.0.0.9:4201".parse().unwrap();
        h.transport.push_from(
            from,
            h.server.frame(&PingResponsePacket {
                ping_id: id_a,
                player_count: 3,
            }),
        );
        h.session.input_iteration();
        assert_eq!(h.servers.server("a").unwrap().player_count, Some(3));
        assert_eq!(h.servers.server("b").unwrap().player_count, None);

        h.transport.push_from(
            from,
            h.server.frame(&PingResponsePacket {
                ping_id: id_a.wrapping_add(999),
                player_count: 50,
            }),
        );
        h.session.input_iteration();
        assert_eq!(h.servers.server("a").unwrap().player_count, Some(3));
        assert_eq!(h.servers.server("b").unwrap().player_count, None);
        assert!(h.errors.drain().is_empty());
    }

    #[test]
    fn ping_round_skips_active_server() {
        let mut h = harness();
        h.login();
        h.session.ping_servers();
        h.session.output_iteration();
        let hosts: Vec<String> = h
            .transport
            .take_sent()
            .into_iter()
            .filter_map(|s| s.to.map(|(host, _)| host))
            .collect();
        assert_eq!(hosts.len(), 2);
        assert!(!hosts.contains(&"a.example".to_string()));
    }

    #[test]
    fn packets_from_other_servers_are_ignored() {
        let mut h = harness();
        h.login();
        h.errors.drain();
        let other: SocketAddr = "10.0.0.9:4202".parse().unwrap();
        h.transport.push_from(
            other,
            h.server.frame(&ServerNoticePacket {
                message: "spoofed".into(),
            }),
        );
        h.session.input_iteration();
        assert!(h.errors.drain().is_empty());

        h.receive(&ServerNoticePacket {
            message: "real".into(),
        });
        assert_eq!(h.errors.drain()[0].message, "real");
    }

    #[test]
    fn suspended_loops_skip_network() {
        let mut h = harness();
        h.login();
        h.errors.drain();
        h.session.suspend();
        assert!(h.session.is_suspended());

        h.transport.push_active(h.server.frame(&ServerNoticePacket {
            message: "later".into(),
        }));
        h.session.input_iteration();
        h.session.send(KeepaliveTcpPacket).unwrap();
        h.session.output_iteration();
        assert!(h.errors.drain().is_empty());
        assert!(h.transport.sent().is_empty());
        assert!(h.session.connected());

        h.session.resume();
        h.session.input_iteration();
        assert_eq!(h.errors.count(Severity::Notice), 1);
        h.session.output_iteration();
        assert_eq!(h.sent_ids(), vec![KeepaliveTcpPacket::ID]);
    }

    #[test]
    fn output_iteration_returns_under_steady_traffic() {
        let mut h = harness_with(SessionConfig {
            queue_poll_ms: 50,
            ..fast_config()
        });
        h.login();
        h.transport.take_sent();
        let done = AtomicBool::new(false);
        let session = &h.session;

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut sends = 0;
                while !done.load(Ordering::SeqCst) && sends < 400 {
                    let _ = session.send(KeepaliveTcpPacket);
                    sends += 1;
                    if sends == 40 {
                        session.suspend();
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
            });

            let start = Instant::now();
            session.output_iteration();
            let first = start.elapsed();

            let mut rounds = 0;
            while !session.is_suspended() && rounds < 200 {
                session.output_iteration();
                rounds += 1;
            }
            let sent = h.transport.sent().len();
            for _ in 0..5 {
                session.output_iteration();
            }
            let after = h.transport.sent().len();
            done.store(true, Ordering::SeqCst);

            assert!(first < Duration::from_millis(500), "took {first:?}");
            assert!(session.is_suspended());
            assert!(sent > 0);
            assert_eq!(after, sent);
        });
    }

    #[test]
    fn concurrent_connects_record_one_target() {
        let h = harness();
        let barrier = std::sync::Barrier::new(8);
        let accepted = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|s| {
            for i in 0..8 {
                let (session, barrier, accepted) = (&h.session, &barrier, &accepted);
                s.spawn(move || {
                    let id = if i % 2 == 0 { "a" } else { "b" };
                    barrier.wait();
                    match session.connect_to(id) {
                        Ok(()) => {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => assert!(matches!(e, SessionError::AlreadyConnecting)),
                    }
                });
            }
        });

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        h.session.output_iteration();
        assert_eq!(h.transport.connects().len(), 1);
    }

    #[test]
    fn garbage_from_other_servers_keeps_session() {
        let mut h = harness();
        h.login();
        h.errors.drain();
        let other: SocketAddr = "10.0.0.9:4202".parse().unwrap();
        h.transport.push_from(other, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        h.session.input_iteration();
        assert!(h.session.connected());
        assert!(h.session.established());
        assert!(h.errors.drain().is_empty());
    }

    #[test]
    fn send_requires_login() {
        let mut h = harness();
        assert!(matches!(
            h.session.send(KeepalivePacket),
            Err(SessionError::NotConnected)
        ));
        h.handshake();
        assert!(matches!(
            h.session.send(KeepalivePacket),
            Err(SessionError::NotLoggedIn)
        ));
        h.receive(&LoggedInPacket {
            tps: 30,
            special_user_data: None,
        });
        h.session.output_iteration();
        h.transport.take_sent();

        h.session.send(RawPacket { id: 12_000, body: vec![5] }).unwrap();
        h.session.output_iteration();
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[test]
    fn send_failure_disconnects_with_message() {
        let mut h = harness();
        h.login();
        h.errors.drain();
        h.transport.fail_send(true);
        h.session.send(KeepaliveTcpPacket).unwrap();
        h.session.output_iteration();
        assert!(!h.session.connected());
        let reports = h.errors.drain();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.contains("disconnected from the active server"));
    }

    #[test]
    fn connect_failure_is_reported() {
        let h = harness();
        h.transport.fail_connect(true);
        h.session.connect_to("a").unwrap();
        h.session.output_iteration();
        assert!(!h.session.connected());
        let reports = h.errors.drain();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.starts_with("Failed to connect"));

        // the attempt is over, a retry is accepted
        h.transport.fail_connect(false);
        h.session.connect_to("a").unwrap();
        h.session.output_iteration();
        assert!(h.session.connected());
    }

    #[test]
    fn receive_error_disconnects_quietly() {
        let mut h = harness();
        h.login();
        h.errors.drain();
        h.transport.push_error(TransportError::Closed);
        h.session.input_iteration();
        assert!(!h.session.connected());
        assert_eq!(h.errors.count(Severity::Error), 1);
        assert_eq!(h.errors.count(Severity::DebugWarning), 1);
        assert!(h.transport.sent().is_empty());
    }

    #[test]
    fn login_failure_clears_token() {
        let mut h = harness();
        h.handshake();
        h.receive(&LoginFailedPacket {
            message: "bad token".into(),
        });
        assert!(!h.session.connected());
        assert!(h.account.auth_token().is_empty());
        let reports = h.errors.drain();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.contains("bad token"));
        assert!(h.transport.sent().is_empty());
    }

    #[test]
    fn server_disconnect_reports_reason() {
        let mut h = harness();
        h.login();
        h.errors.drain();
        h.receive(&ServerDisconnectPacket {
            message: "restarting".into(),
        });
        assert!(!h.session.connected());
        assert!(h.errors.drain()[0].message.contains("restarting"));
        assert_eq!(h.sent_ids(), vec![DisconnectPacket::ID]);
    }

    #[test]
    fn ban_and_mute_notices() {
        let mut h = harness();
        h.login();
        h.errors.drain();
        h.receive(&ServerMutedPacket {
            reason: "spam".into(),
            timestamp: 1_700_000_000,
        });
        assert!(h.session.connected());
        let muted = h.errors.drain();
        assert_eq!(muted[0].severity, Severity::Warning);
        assert!(muted[0].message.contains("2023-11-14"));

        h.receive(&ServerBannedPacket {
            message: "cheating".into(),
            timestamp: 0,
        });
        assert!(!h.session.connected());
        let banned = h.errors.drain();
        assert_eq!(banned.len(), 1);
        assert!(banned[0].message.contains("permanently"));
        assert!(banned[0].message.contains("cheating"));
    }

    #[test]
    fn protocol_mismatch_override_retries_with_sentinel() {
        let h = harness_with(SessionConfig {
            allow_protocol_override: true,
            ..fast_config()
        });
        h.connect();
        h.receive(&ProtocolMismatchPacket { server_protocol: 6 });
        assert!(!h.session.connected());
        assert!(h.errors.drain().is_empty());
        h.main_queue.drain();
        assert!(h
            .observer
            .events()
            .contains(&"mismatch:6:7:true".to_string()));

        h.session.set_ignore_protocol_mismatch(true);
        assert_eq!(h.session.used_protocol(), IGNORE_PROTOCOL_VERSION);
        let sent = h.connect();
        let start = sent[0]
            .downcast_ref::<CryptoHandshakeStartPacket>()
            .unwrap();
        assert_eq!(start.protocol, 0xffff);
    }

    #[test]
    fn protocol_mismatch_without_override_explains() {
        let h = harness();
        h.connect();
        h.receive(&ProtocolMismatchPacket { server_protocol: 9 });
        assert!(!h.session.connected());
        let reports = h.errors.drain();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].message.contains("outdated"));
    }

    #[test]
    fn keepalive_response_updates_active_server() {
        let mut h = harness();
        h.login();
        h.receive(&KeepaliveResponsePacket { player_count: 12 });
        let a = h.servers.server("a").unwrap();
        assert_eq!(a.player_count, Some(12));
        assert!(a.latency.is_some());
        assert_eq!(h.session.active_server().unwrap().id, "a");
    }

    #[test]
    fn room_packets_reach_observer() {
        let mut h = harness();
        h.login();
        h.main_queue.drain();
        h.errors.drain();
        h.receive(&RoomInvitePacket {
            room_id: 42,
            inviter: PlayerPreview {
                account_id: 5,
                name: "ally".into(),
                profile: PlayerProfile::default(),
            },
        });
        h.receive(&RoomInfoPacket {
            info: RoomInfo {
                room_id: 42,
                name: "lobby".into(),
                ..Default::default()
            },
        });
        assert_eq!(h.errors.count(Severity::Success), 1);
        h.main_queue.drain();
        assert_eq!(
            h.observer.events(),
            vec![
                "logged_in:".to_string(),
                "invite:42:ally".to_string(),
                "room:lobby".to_string()
            ]
        );
    }

    #[test]
    fn disconnect_when_idle_is_noop() {
        let h = harness();
        h.session.disconnect(false, false);
        assert!(h.transport.sent().is_empty());
        h.main_queue.drain();
        assert!(h.observer.events().is_empty());
    }

    #[test]
    fn manager_runs_threads_and_shuts_down() {
        let transport = Arc::new(MemoryTransport::new());
        let servers = Arc::new(ServerDirectory::new());
        servers.add_server(GameServer::new("a", "Alpha", "a.example", 4201));
        let account = Arc::new(AccountStore::default());
        account.set_auth_token("t");
        let errors: Arc<dyn ErrorSink> = Arc::new(ErrorQueues::new(false));
        let ctx = Context::new(fast_config(), servers.clone(), account, errors);

        let mut manager = SessionManager::start(ctx, transport.clone()).unwrap();
        manager.session().connect_to("a").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.sent().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(manager.session().connected());

        let session = Arc::clone(manager.session());
        manager.shutdown();
        assert!(!session.connected());
        // shutdown keeps the active selection for a later reconnect
        assert_eq!(servers.active_id().as_deref(), Some("a"));
        assert!(matches!(
            session.register_listener(OwnerHandle::new(), 21_000, |_| {}, false),
            Err(SessionError::ListenersClosed)
        ));
    }
}
