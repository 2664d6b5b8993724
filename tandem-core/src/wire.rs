//! Framing: 4 bytes LE length + 2 bytes LE packet id + 1 flag byte + body.
//!
//! The length covers everything after itself. Stream and datagram frames use the same layout.

use crate::codec::PacketId;

const LEN_SIZE: usize = 4;
const HEADER_SIZE: usize = 3; // id + flags
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

const FLAG_ENCRYPTED: u8 = 0b0000_0001;

/// One frame off the wire. `body` is still sealed when `encrypted` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: PacketId,
    pub encrypted: bool,
    pub body: Vec<u8>,
}

/// Encode a frame from an already encoded (and possibly sealed) body.
pub fn encode_frame(id: PacketId, encrypted: bool, body: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = (HEADER_SIZE + body.len()) as u64;
    if len > MAX_FRAME_LEN as u64 {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + len as usize);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.push(if encrypted { FLAG_ENCRYPTED } else { 0 });
    out.extend_from_slice(body);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Total size of the first frame in `bytes`, if its length prefix is complete.
pub fn frame_len(bytes: &[u8]) -> Result<Option<usize>, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Ok(None);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(Some(LEN_SIZE + len as usize))
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    let total = frame_len(bytes)?.ok_or(FrameDecodeError::NeedMore)?;
    if total < LEN_SIZE + HEADER_SIZE {
        return Err(FrameDecodeError::Truncated);
    }
    if bytes.len() < total {
        return Err(FrameDecodeError::NeedMore);
    }
    let id = PacketId::from_le_bytes([bytes[LEN_SIZE], bytes[LEN_SIZE + 1]]);
    let flags = bytes[LEN_SIZE + 2];
    let frame = Frame {
        id,
        encrypted: flags & FLAG_ENCRYPTED != 0,
        body: bytes[LEN_SIZE + HEADER_SIZE..total].to_vec(),
    };
    Ok((frame, total))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("frame shorter than its header")]
    Truncated,
}
