//! Link: transport + secure channel + codec. Turns packets into frames and back.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::codec::{CodecError, Packet, PacketRegistry, PacketType};
use crate::packet_log::{Direction, PacketLog};
use crate::protocol::PingResponsePacket;
use crate::secure::{CryptoError, PublicKey, SecureChannel};
use crate::transport::{Origin, Transport, TransportError};
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

/// A decoded inbound packet and where it came from.
pub struct Inbound {
    pub packet: Arc<dyn Packet>,
    pub origin: Origin,
}

impl Inbound {
    pub fn from_active(&self) -> bool {
        self.origin == Origin::Active
    }
}

pub struct Link {
    transport: Arc<dyn Transport>,
    secure: RwLock<SecureChannel>,
    registry: RwLock<PacketRegistry>,
    log: Option<PacketLog>,
}

impl Link {
    pub fn new(transport: Arc<dyn Transport>, log: Option<PacketLog>) -> Self {
        Self {
            transport,
            secure: RwLock::new(SecureChannel::new()),
            registry: RwLock::new(PacketRegistry::with_protocol()),
            log,
        }
    }

    pub fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), LinkError> {
        self.transport.connect(host, port, timeout)?;
        Ok(())
    }

    /// Fresh key pair for a new connection. Drops any previous shared key.
    pub fn generate_keys(&self) {
        self.secure.write().generate_keys();
    }

    pub fn public_key(&self) -> Result<PublicKey, LinkError> {
        Ok(self.secure.read().extract_public_key()?)
    }

    pub fn set_peer_key(&self, key: &PublicKey) -> Result<(), LinkError> {
        self.secure.write().set_peer_key(key)?;
        Ok(())
    }

    pub fn register_packet<T: PacketType>(&self) {
        self.registry.write().register::<T>();
    }

    fn seal(&self, packet: &dyn Packet) -> Result<Vec<u8>, LinkError> {
        let mut body = packet.encode()?;
        if packet.encrypted() {
            body = self.secure.read().encrypt(&body)?;
        }
        Ok(wire::encode_frame(packet.id(), packet.encrypted(), &body)?)
    }

    /// Send to the connected server over the packet's channel.
    pub fn send_packet(&self, packet: &dyn Packet) -> Result<(), LinkError> {
        let frame = self.seal(packet)?;
        self.transport.send(packet.channel(), &frame)?;
        self.record(Direction::Sent, packet, frame.len());
        Ok(())
    }

    /// Send a datagram to an arbitrary server, connected or not.
    pub fn send_packet_to(&self, packet: &dyn Packet, host: &str, port: u16) -> Result<(), LinkError> {
        let frame = self.seal(packet)?;
        self.transport.send_to(&frame, host, port)?;
        self.record(Direction::Sent, packet, frame.len());
        Ok(())
    }

    /// Receive and decode one packet, waiting at most `timeout`.
    ///
    /// Datagrams from addresses other than the active server are only accepted as ping
    /// responses. Anything else from them, malformed or not, is dropped and reads as `Ok(None)`.
    pub fn recv_packet(&self, timeout: Duration) -> Result<Option<Inbound>, LinkError> {
        let Some(received) = self.transport.recv(timeout)? else {
            return Ok(None);
        };
        let packet = match received.origin {
            Origin::Active => self.open(&received.bytes)?,
            Origin::Other(from) => match self.open(&received.bytes) {
                Ok(packet) if packet.is::<PingResponsePacket>() => packet,
                Ok(packet) => {
                    tracing::debug!(id = packet.id(), %from, "dropping datagram from inactive server");
                    return Ok(None);
                }
                Err(e) => {
                    tracing::debug!(%from, "dropping malformed datagram: {e}");
                    return Ok(None);
                }
            },
        };
        self.record(Direction::Received, packet.as_ref(), received.bytes.len());
        Ok(Some(Inbound {
            packet,
            origin: received.origin,
        }))
    }

    fn open(&self, bytes: &[u8]) -> Result<Arc<dyn Packet>, LinkError> {
        let (frame, _) = wire::decode_frame(bytes)?;
        if frame.encrypted {
            let plain = self.secure.read().decrypt(&frame.body)?;
            Ok(self.registry.read().decode(frame.id, &plain)?)
        } else {
            Ok(self.registry.read().decode(frame.id, &frame.body)?)
        }
    }

    /// Close the control stream and forget the session keys.
    pub fn close(&self) {
        self.transport.close();
        self.secure.write().reset();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn record(&self, direction: Direction, packet: &dyn Packet, len: usize) {
        if let Some(log) = &self.log {
            log.record(direction, packet, len);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    FrameEncode(#[from] FrameEncodeError),
    #[error("malformed frame: {0}")]
    FrameDecode(#[from] FrameDecodeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
