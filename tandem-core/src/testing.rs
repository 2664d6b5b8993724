//! Test doubles: an in-memory transport and a scripted server end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::codec::{Channel, Packet, PacketRegistry};
use crate::link::LinkError;
use crate::secure::{PublicKey, SecureChannel};
use crate::transport::{Origin, Received, Transport, TransportError};
use crate::wire;

/// One frame handed to the transport.
#[derive(Debug, Clone)]
pub(crate) struct Sent {
    /// Set for `send`, `None` for `send_to`.
    pub channel: Option<Channel>,
    /// Set for `send_to`.
    pub to: Option<(String, u16)>,
    pub bytes: Vec<u8>,
}

pub(crate) struct MemoryTransport {
    connected: AtomicBool,
    connects: Mutex<Vec<(String, u16)>>,
    sent: Mutex<Vec<Sent>>,
    inbound_tx: Sender<Result<Received, TransportError>>,
    inbound_rx: Receiver<Result<Received, TransportError>>,
    fail_connect: AtomicBool,
    fail_send: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            connected: AtomicBool::new(false),
            connects: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx,
            fail_connect: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn connects(&self) -> Vec<(String, u16)> {
        self.connects.lock().clone()
    }

    pub fn push_active(&self, bytes: Vec<u8>) {
        let _ = self.inbound_tx.send(Ok(Received {
            bytes,
            origin: Origin::Active,
        }));
    }

    pub fn push_from(&self, from: SocketAddr, bytes: Vec<u8>) {
        let _ = self.inbound_tx.send(Ok(Received {
            bytes,
            origin: Origin::Other(from),
        }));
    }

    pub fn push_error(&self, error: TransportError) {
        let _ = self.inbound_tx.send(Err(error));
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    fn check_send(&self) -> Result<(), TransportError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::Send(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, host: &str, port: u16, _timeout: Duration) -> Result<(), TransportError> {
        self.connects.lock().push((host.to_string(), port));
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, channel: Channel, bytes: &[u8]) -> Result<usize, TransportError> {
        self.check_send()?;
        self.sent.lock().push(Sent {
            channel: Some(channel),
            to: None,
            bytes: bytes.to_vec(),
        });
        Ok(bytes.len())
    }

    fn send_to(&self, bytes: &[u8], host: &str, port: u16) -> Result<usize, TransportError> {
        self.check_send()?;
        self.sent.lock().push(Sent {
            channel: None,
            to: Some((host.to_string(), port)),
            bytes: bytes.to_vec(),
        });
        Ok(bytes.len())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Received>, TransportError> {
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(item) => item.map(Some),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// The server side of a session: its own key pair and a full codec.
pub(crate) struct FakeServer {
    secure: SecureChannel,
    registry: PacketRegistry,
}

impl FakeServer {
    pub fn new() -> Self {
        let mut secure = SecureChannel::new();
        secure.generate_keys();
        Self {
            secure,
            registry: PacketRegistry::with_protocol(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.secure
            .extract_public_key()
            .expect("fake server always has keys")
    }

    /// Complete the exchange with the client's key.
    pub fn accept_key(&mut self, client: &PublicKey) {
        self.secure
            .set_peer_key(client)
            .expect("fake server always has keys");
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Packet>, LinkError> {
        let (frame, _) = wire::decode_frame(bytes)?;
        let body = if frame.encrypted {
            self.secure.decrypt(&frame.body)?
        } else {
            frame.body
        };
        Ok(self.registry.decode(frame.id, &body)?)
    }

    pub fn decode_all(&self, sent: &[Sent]) -> Vec<Arc<dyn Packet>> {
        sent.iter()
            .map(|s| self.decode(&s.bytes).expect("client frame decodes"))
            .collect()
    }

    /// Plaintext frame for `packet`.
    pub fn frame(&self, packet: &dyn Packet) -> Vec<u8> {
        let body = packet.encode().expect("packet encodes");
        wire::encode_frame(packet.id(), false, &body).expect("frame fits")
    }

    /// Frame sealed with the session key.
    pub fn sealed_frame(&self, packet: &dyn Packet) -> Vec<u8> {
        let body = packet.encode().expect("packet encodes");
        let sealed = self.secure.encrypt(&body).expect("key exchange done");
        wire::encode_frame(packet.id(), true, &sealed).expect("frame fits")
    }
}
