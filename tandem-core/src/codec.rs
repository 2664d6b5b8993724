//! Packet codec: the `Packet` capability set, typed payloads, and the id -> decoder registry.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol;

/// 16-bit packet id. Client-origin and server-origin ids come from disjoint ranges.
pub type PacketId = u16;

/// Which socket a packet travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Stream socket to the active server.
    Control,
    /// Datagram socket (active server or any address for probes).
    Data,
}

/// Range a packet id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOrigin {
    Client,
    Server,
    Unknown,
}

impl PacketOrigin {
    pub fn of(id: PacketId) -> Self {
        if protocol::CLIENT_ID_RANGE.contains(&id) {
            PacketOrigin::Client
        } else if protocol::SERVER_ID_RANGE.contains(&id) {
            PacketOrigin::Server
        } else {
            PacketOrigin::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PacketOrigin::Client => "client",
            PacketOrigin::Server => "server",
            PacketOrigin::Unknown => "unknown",
        }
    }
}

/// A decoded or outgoing packet. Object-safe so packets can be shared as `Arc<dyn Packet>`.
pub trait Packet: Any + Send + Sync + fmt::Debug {
    fn id(&self) -> PacketId;
    /// Whether the body is sealed with the session box.
    fn encrypted(&self) -> bool;
    fn channel(&self) -> Channel;
    fn encode(&self) -> Result<Vec<u8>, CodecError>;
    fn as_any(&self) -> &dyn Any;
}

impl dyn Packet {
    /// Borrow the concrete payload if this packet is a `T`.
    pub fn downcast_ref<T: PacketType>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: PacketType>(&self) -> bool {
        self.id() == T::ID && self.as_any().is::<T>()
    }
}

/// Typed payload with a fixed id. Implementing this is enough to send and receive a type.
pub trait PacketType: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    const ID: PacketId;
    const ENCRYPTED: bool = false;
    const CHANNEL: Channel = Channel::Control;
}

impl<T: PacketType> Packet for T {
    fn id(&self) -> PacketId {
        T::ID
    }

    fn encrypted(&self) -> bool {
        T::ENCRYPTED
    }

    fn channel(&self) -> Channel {
        T::CHANNEL
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Encode)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Packet whose id has no registered decoder. The body is kept as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub id: PacketId,
    pub body: Vec<u8>,
}

impl Packet for RawPacket {
    fn id(&self) -> PacketId {
        self.id
    }

    fn encrypted(&self) -> bool {
        false
    }

    fn channel(&self) -> Channel {
        Channel::Control
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.body.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type Decoder = fn(&[u8]) -> Result<Arc<dyn Packet>, CodecError>;

fn decode_as<T: PacketType>(body: &[u8]) -> Result<Arc<dyn Packet>, CodecError> {
    let value: T = bincode::deserialize(body).map_err(CodecError::Decode)?;
    Ok(Arc::new(value))
}

/// Maps packet ids to decoders.
pub struct PacketRegistry {
    decoders: HashMap<PacketId, Decoder>,
}

impl PacketRegistry {
    /// Empty registry: every id decodes to `RawPacket`.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry with every protocol-level packet, both directions.
    pub fn with_protocol() -> Self {
        let mut registry = Self::new();
        protocol::register_all(&mut registry);
        registry
    }

    /// Register (or replace) the decoder for `T::ID`.
    pub fn register<T: PacketType>(&mut self) {
        self.decoders.insert(T::ID, decode_as::<T>);
    }

    pub fn contains(&self, id: PacketId) -> bool {
        self.decoders.contains_key(&id)
    }

    /// Decode a plaintext body. Unknown ids yield a `RawPacket`.
    pub fn decode(&self, id: PacketId, body: &[u8]) -> Result<Arc<dyn Packet>, CodecError> {
        match self.decoders.get(&id) {
            Some(decoder) => decoder(body),
            None => Ok(Arc::new(RawPacket {
                id,
                body: body.to_vec(),
            })),
        }
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode packet: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode packet: {0}")]
    Decode(#[source] bincode::Error),
}
