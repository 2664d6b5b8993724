//! Tandem wire protocol: packet ids, control packet payloads and version.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::codec::{Channel, PacketId, PacketRegistry, PacketType};
use crate::secure::PublicKey;

/// Current protocol version. Sent in the handshake start.
pub const PROTOCOL_VERSION: u16 = 7;

/// Magic version that asks the server to skip its protocol check.
pub const IGNORE_PROTOCOL_VERSION: u16 = 0xffff;

/// Ids of packets sent by the client.
pub const CLIENT_ID_RANGE: Range<PacketId> = 10000..20000;
/// Ids of packets sent by the server.
pub const SERVER_ID_RANGE: Range<PacketId> = 20000..30000;

// client -> server

/// Latency / player count probe, sent to any known server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPacket {
    pub ping_id: u32,
}

impl PacketType for PingPacket {
    const ID: PacketId = 10000;
    const CHANNEL: Channel = Channel::Data;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoHandshakeStartPacket {
    pub protocol: u16,
    pub key: PublicKey,
}

impl PacketType for CryptoHandshakeStartPacket {
    const ID: PacketId = 10001;
}

/// Data-channel keepalive; the response carries the player count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepalivePacket;

impl PacketType for KeepalivePacket {
    const ID: PacketId = 10002;
    const CHANNEL: Channel = Channel::Data;
}

/// Icon and color selection shown to other players.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub icon_id: i16,
    pub primary_color: i16,
    pub secondary_color: i16,
    pub glow_color: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPacket {
    pub secret_key: u32,
    pub account_id: i32,
    pub user_id: i32,
    pub account_name: String,
    pub token: String,
    pub profile: PlayerProfile,
    pub fragmentation_limit: u32,
}

impl PacketType for LoginPacket {
    const ID: PacketId = 10003;
    const ENCRYPTED: bool = true;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectPacket;

impl PacketType for DisconnectPacket {
    const ID: PacketId = 10004;
}

/// Ties the datagram flow to the stream session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimThreadPacket {
    pub secret_key: u32,
}

impl PacketType for ClaimThreadPacket {
    const ID: PacketId = 10005;
    const CHANNEL: Channel = Channel::Data;
}

/// Keeps NAT state for the stream socket alive. No payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveTcpPacket;

impl PacketType for KeepaliveTcpPacket {
    const ID: PacketId = 10006;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAuthPacket {
    pub password: String,
}

impl PacketType for AdminAuthPacket {
    const ID: PacketId = 19000;
    const ENCRYPTED: bool = true;
}

// server -> client

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponsePacket {
    pub ping_id: u32,
    pub player_count: u32,
}

impl PacketType for PingResponsePacket {
    const ID: PacketId = 20000;
    const CHANNEL: Channel = Channel::Data;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoHandshakeResponsePacket {
    pub key: PublicKey,
}

impl PacketType for CryptoHandshakeResponsePacket {
    const ID: PacketId = 20001;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveResponsePacket {
    pub player_count: u32,
}

impl PacketType for KeepaliveResponsePacket {
    const ID: PacketId = 20002;
    const CHANNEL: Channel = Channel::Data;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDisconnectPacket {
    pub message: String,
}

impl PacketType for ServerDisconnectPacket {
    const ID: PacketId = 20003;
}

/// Extra presentation data the server attaches to privileged users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialUserData {
    pub name_color: Option<String>,
    pub badge: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedInPacket {
    pub tps: u32,
    pub special_user_data: Option<SpecialUserData>,
}

impl PacketType for LoggedInPacket {
    const ID: PacketId = 20004;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginFailedPacket {
    pub message: String,
}

impl PacketType for LoginFailedPacket {
    const ID: PacketId = 20005;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMismatchPacket {
    pub server_protocol: u16,
}

impl PacketType for ProtocolMismatchPacket {
    const ID: PacketId = 20006;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveTcpResponsePacket;

impl PacketType for KeepaliveTcpResponsePacket {
    const ID: PacketId = 20007;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNoticePacket {
    pub message: String,
}

impl PacketType for ServerNoticePacket {
    const ID: PacketId = 20009;
}

/// `timestamp` is the unix expiry in seconds, 0 for permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerBannedPacket {
    pub message: String,
    pub timestamp: i64,
}

impl PacketType for ServerBannedPacket {
    const ID: PacketId = 20010;
}

/// `timestamp` is the unix expiry in seconds, 0 for permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMutedPacket {
    pub reason: String,
    pub timestamp: i64,
}

impl PacketType for ServerMutedPacket {
    const ID: PacketId = 20011;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerPreview {
    pub account_id: i32,
    pub name: String,
    pub profile: PlayerProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInvitePacket {
    pub room_id: u32,
    pub inviter: PlayerPreview,
}

impl PacketType for RoomInvitePacket {
    const ID: PacketId = 20200;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: u32,
    pub owner: i32,
    pub name: String,
    pub player_limit: u16,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfoPacket {
    pub info: RoomInfo,
}

impl PacketType for RoomInfoPacket {
    const ID: PacketId = 20201;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAuthSuccessPacket {
    pub role: i32,
}

impl PacketType for AdminAuthSuccessPacket {
    const ID: PacketId = 29000;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAuthFailedPacket;

impl PacketType for AdminAuthFailedPacket {
    const ID: PacketId = 29001;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminErrorPacket {
    pub message: String,
}

impl PacketType for AdminErrorPacket {
    const ID: PacketId = 29002;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSuccessMessagePacket {
    pub message: String,
}

impl PacketType for AdminSuccessMessagePacket {
    const ID: PacketId = 29003;
}

/// Register every packet defined here.
pub(crate) fn register_all(registry: &mut PacketRegistry) {
    registry.register::<PingPacket>();
    registry.register::<CryptoHandshakeStartPacket>();
    registry.register::<KeepalivePacket>();
    registry.register::<LoginPacket>();
    registry.register::<DisconnectPacket>();
    registry.register::<ClaimThreadPacket>();
    registry.register::<KeepaliveTcpPacket>();
    registry.register::<AdminAuthPacket>();

    registry.register::<PingResponsePacket>();
    registry.register::<CryptoHandshakeResponsePacket>();
    registry.register::<KeepaliveResponsePacket>();
    registry.register::<ServerDisconnectPacket>();
    registry.register::<LoggedInPacket>();
    registry.register::<LoginFailedPacket>();
    registry.register::<ProtocolMismatchPacket>();
    registry.register::<KeepaliveTcpResponsePacket>();
    registry.register::<ServerNoticePacket>();
    registry.register::<ServerBannedPacket>();
    registry.register::<ServerMutedPacket>();
    registry.register::<RoomInvitePacket>();
    registry.register::<RoomInfoPacket>();
    registry.register::<AdminAuthSuccessPacket>();
    registry.register::<AdminAuthFailedPacket>();
    registry.register::<AdminErrorPacket>();
    registry.register::<AdminSuccessMessagePacket>();
}
