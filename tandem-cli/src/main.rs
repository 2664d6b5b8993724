// Tandem headless client: keeps one game-server session alive and pings the rest of the list.

mod config;

use std::sync::Arc;
use std::time::Duration;

use tandem_core::protocol::{KeepaliveResponsePacket, PlayerPreview, RoomInfo, SpecialUserData};
use tandem_core::{
    Context, ErrorQueues, NetTransport, OwnerHandle, SessionManager, SessionObserver, Severity,
};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Consumer tick: the main queue and the error sink are drained at this rate.
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

fn main() -> anyhow::Result<()> {
    let mut ignore_protocol_mismatch = false;
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("tandem {}", VERSION);
            return Ok(());
        }
        if arg == "--ignore-protocol-mismatch" {
            ignore_protocol_mismatch = true;
        }
    }

    let cfg = config::load()?;
    init_logging(&cfg.log_level);
    tracing::info!("tandem {VERSION} starting");

    let servers = Arc::new(tandem_core::ServerDirectory::new());
    servers.set_servers(cfg.game_servers());
    let account = Arc::new(tandem_core::AccountStore::new(cfg.account.snapshot()));
    account.set_auth_token(cfg.account.auth_token.clone());
    account.set_admin_password(cfg.account.admin_password.clone());
    let errors = Arc::new(ErrorQueues::new(tracing::enabled!(tracing::Level::DEBUG)));

    let ctx = Context::new(cfg.session.clone(), servers.clone(), account, errors.clone())
        .with_observer(Arc::new(LogObserver));
    let main_queue = ctx.main_queue.clone();

    let transport = Arc::new(NetTransport::bind()?);
    let mut manager = SessionManager::start(ctx, transport)?;
    let session = Arc::clone(manager.session());
    session.set_ignore_protocol_mismatch(ignore_protocol_mismatch);

    let owner = OwnerHandle::new();
    session.listen::<KeepaliveResponsePacket, _>(
        owner,
        |p| tracing::debug!(players = p.player_count, "keepalive answered"),
        false,
    )?;

    if cfg.standalone {
        session.connect_standalone()?;
    } else if let Some(id) = &cfg.server {
        session.connect_to(id)?;
    } else {
        tracing::info!("no server configured, pinging only");
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut frame = tokio::time::interval(FRAME_INTERVAL);
        let mut ping = tokio::time::interval(Duration::from_secs(cfg.ping_interval_secs.max(1)));
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res?;
                    break;
                }
                _ = frame.tick() => {
                    main_queue.drain();
                    report(&errors);
                }
                _ = ping.tick() => session.ping_servers(),
            }
        }
        anyhow::Ok(())
    })?;

    tracing::info!("shutting down");
    session.unregister_owner(owner);
    manager.shutdown();
    main_queue.drain();
    report(&errors);
    for server in servers.servers() {
        tracing::debug!(
            id = %server.id,
            players = ?server.player_count,
            latency_ms = ?server.latency.map(|l| l.as_millis()),
            "last known server state"
        );
    }
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

/// Re-emit queued user-facing messages through the log.
fn report(errors: &ErrorQueues) {
    for r in errors.drain() {
        match r.severity {
            Severity::Error => tracing::error!("{}", r.message),
            Severity::Warning => tracing::warn!("{}", r.message),
            Severity::DebugWarning => tracing::debug!("{}", r.message),
            Severity::Notice | Severity::Success => tracing::info!("{}", r.message),
        }
    }
}

/// Logs what a UI would show.
struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_logged_in(&self, special: Option<SpecialUserData>) {
        let badge = special.and_then(|s| s.badge);
        tracing::info!(badge = ?badge, "logged in");
    }

    fn on_room_invite(&self, room_id: u32, inviter: PlayerPreview) {
        tracing::info!(room_id, from = %inviter.name, "room invite");
    }

    fn on_room_info(&self, info: RoomInfo) {
        tracing::info!(room_id = info.room_id, name = %info.name, "room updated");
    }

    fn on_protocol_mismatch(&self, server: u16, client: u16, override_allowed: bool) {
        if override_allowed {
            tracing::warn!(
                server,
                client,
                "protocol mismatch; restart with --ignore-protocol-mismatch to connect anyway"
            );
        }
    }

    fn on_disconnected(&self) {
        tracing::info!("back in the global room");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
