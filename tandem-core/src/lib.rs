//! Tandem client session layer.
//! Encrypted stream + datagram link to one game server, packet dispatch, keepalive and ping.

pub mod account;
pub mod codec;
pub mod config;
pub mod context;
pub mod link;
pub mod listener;
pub mod main_queue;
pub mod observer;
pub mod packet_log;
pub mod protocol;
pub mod secure;
pub mod servers;
pub mod session;
pub mod sink;
pub mod transport;
pub mod wire;
pub mod worker;

#[cfg(test)]
mod testing;

pub use account::{AccountProvider, AccountSnapshot, AccountStore};
pub use codec::{Channel, Packet, PacketId, PacketRegistry, PacketType, RawPacket};
pub use config::SessionConfig;
pub use context::Context;
pub use listener::OwnerHandle;
pub use main_queue::MainQueue;
pub use observer::{NoopObserver, SessionObserver};
pub use protocol::{IGNORE_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use servers::{GameServer, ServerAddress, ServerDirectory, STANDALONE_ID};
pub use session::{Session, SessionError, SessionManager};
pub use sink::{ErrorQueues, ErrorSink, Report, Severity};
pub use transport::{NetTransport, Transport, TransportError};
