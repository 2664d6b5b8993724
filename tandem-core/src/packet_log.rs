//! Append-only JSON-lines log of every packet the link sends or receives.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::codec::{Packet, PacketId, PacketOrigin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Serialize)]
struct Entry<'a> {
    ts_ms: u64,
    direction: Direction,
    id: PacketId,
    origin: &'a str,
    encrypted: bool,
    len: usize,
}

pub struct PacketLog {
    out: Mutex<BufWriter<File>>,
}

impl PacketLog {
    /// Open (or create) `path` for appending.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one entry. `len` is the frame size on the wire. Write errors are logged and dropped.
    pub fn record(&self, direction: Direction, packet: &dyn Packet, len: usize) {
        let entry = Entry {
            ts_ms: now_ms(),
            direction,
            id: packet.id(),
            origin: PacketOrigin::of(packet.id()).as_str(),
            encrypted: packet.encrypted(),
            len,
        };
        let mut out = self.out.lock();
        let result = serde_json::to_writer(&mut *out, &entry)
            .map_err(std::io::Error::from)
            .and_then(|_| out.write_all(b"\n"))
            .and_then(|_| out.flush());
        if let Err(e) = result {
            tracing::warn!("packet log write failed: {e}");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
