//! Hooks into the host's presentation layer. Always called on the consumer context.

use crate::protocol::{PlayerPreview, RoomInfo, SpecialUserData};

pub trait SessionObserver: Send + Sync {
    fn on_logged_in(&self, _special: Option<SpecialUserData>) {}

    fn on_room_invite(&self, _room_id: u32, _inviter: PlayerPreview) {}

    fn on_room_info(&self, _info: RoomInfo) {}

    /// The server speaks another protocol version. `override_allowed` is set when the host may
    /// retry with `Session::set_ignore_protocol_mismatch`.
    fn on_protocol_mismatch(&self, _server: u16, _client: u16, _override_allowed: bool) {}

    /// The session was torn down and the active server cleared; reset to the global room.
    fn on_disconnected(&self) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}
