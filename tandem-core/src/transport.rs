//! Raw sockets: one control stream and one datagram socket, every operation bounded by a timeout.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::codec::Channel;
use crate::wire;

/// Longest single wait on the stream inside `recv`; the datagram socket is checked between waits.
const STREAM_POLL_SLICE: Duration = Duration::from_millis(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const RECV_BUFFER_SIZE: usize = 65536;

/// Where a received frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The control stream, or a datagram from the connected server.
    Active,
    /// A datagram from any other address.
    Other(SocketAddr),
}

/// One complete frame (length prefix included).
#[derive(Debug, Clone)]
pub struct Received {
    pub bytes: Vec<u8>,
    pub origin: Origin,
}

/// Socket layer used by the session. Shared between the output and input threads.
pub trait Transport: Send + Sync {
    /// Open the control stream to `host:port` and remember it as the datagram peer.
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), TransportError>;

    /// Send a frame to the connected server over `channel`.
    fn send(&self, channel: Channel, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Send a datagram to any address.
    fn send_to(&self, bytes: &[u8], host: &str, port: u16) -> Result<usize, TransportError>;

    /// Wait up to `timeout` for one frame. `Ok(None)` on timeout.
    fn recv(&self, timeout: Duration) -> Result<Option<Received>, TransportError>;

    /// Close the control stream. The datagram socket stays bound.
    fn close(&self);

    fn is_connected(&self) -> bool;
}

/// `Transport` over `std::net` sockets.
pub struct NetTransport {
    udp: UdpSocket,
    stream: Mutex<Option<Arc<TcpStream>>>,
    peer: Mutex<Option<SocketAddr>>,
    stream_buf: Mutex<Vec<u8>>,
}

impl NetTransport {
    /// Bind the datagram socket on an ephemeral port.
    pub fn bind() -> Result<Self, TransportError> {
        let udp = UdpSocket::bind(("0.0.0.0", 0)).map_err(TransportError::Bind)?;
        let transport = Self {
            udp,
            stream: Mutex::new(None),
            peer: Mutex::new(None),
            stream_buf: Mutex::new(Vec::new()),
        };
        transport.set_nonblocking(true)?;
        Ok(transport)
    }

    /// Switch the datagram socket between blocking and non-blocking reads.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), TransportError> {
        self.udp
            .set_nonblocking(nonblocking)
            .map_err(TransportError::Bind)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.udp.local_addr().map_err(TransportError::Bind)
    }

    fn stream(&self) -> Option<Arc<TcpStream>> {
        self.stream.lock().clone()
    }

    /// Pop one complete frame from the stream buffer.
    fn take_buffered_frame(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut buf = self.stream_buf.lock();
        match wire::frame_len(&buf).map_err(|e| TransportError::Malformed(e.to_string()))? {
            Some(total) if buf.len() >= total => Ok(Some(buf.drain(..total).collect())),
            _ => Ok(None),
        }
    }

    /// Read whatever the stream has within one slice. Returns true if bytes arrived.
    fn fill_from_stream(&self, stream: &TcpStream, scratch: &mut [u8]) -> Result<bool, TransportError> {
        let mut reader = stream;
        match reader.read(scratch) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => {
                self.stream_buf.lock().extend_from_slice(&scratch[..n]);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(TransportError::Receive(e)),
        }
    }

    fn try_recv_datagram(&self, scratch: &mut [u8]) -> Result<Option<Received>, TransportError> {
        match self.udp.recv_from(scratch) {
            Ok((n, from)) => {
                let origin = if *self.peer.lock() == Some(from) {
                    Origin::Active
                } else {
                    Origin::Other(from)
                };
                Ok(Some(Received {
                    bytes: scratch[..n].to_vec(),
                    origin,
                }))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            // ICMP port unreachable from an earlier probe surfaces here on some platforms.
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(TransportError::Receive(e)),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve(format!("{host}:{port}: {e}")))?;
    // the datagram socket is bound to an IPv4 wildcard
    addrs
        .find(|a| a.is_ipv4())
        .ok_or_else(|| TransportError::Resolve(format!("{host}:{port}: no IPv4 address")))
}

impl Transport for NetTransport {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), TransportError> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(TransportError::Connect)?;
        stream.set_nodelay(true).map_err(TransportError::Connect)?;
        stream
            .set_read_timeout(Some(STREAM_POLL_SLICE))
            .map_err(TransportError::Connect)?;
        stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(TransportError::Connect)?;

        self.stream_buf.lock().clear();
        *self.peer.lock() = Some(addr);
        *self.stream.lock() = Some(Arc::new(stream));
        tracing::debug!(%addr, "control stream connected");
        Ok(())
    }

    fn send(&self, channel: Channel, bytes: &[u8]) -> Result<usize, TransportError> {
        match channel {
            Channel::Control => {
                let stream = self.stream().ok_or(TransportError::NotConnected)?;
                let mut writer = &*stream;
                writer.write_all(bytes).map_err(TransportError::Send)?;
                Ok(bytes.len())
            }
            Channel::Data => {
                let peer = (*self.peer.lock()).ok_or(TransportError::NotConnected)?;
                self.udp.send_to(bytes, peer).map_err(TransportError::Send)
            }
        }
    }

    fn send_to(&self, bytes: &[u8], host: &str, port: u16) -> Result<usize, TransportError> {
        let addr = resolve(host, port)?;
        self.udp.send_to(bytes, addr).map_err(TransportError::Send)
    }

    fn recv(&self, timeout: Duration) -> Result<Option<Received>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut scratch = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            if let Some(bytes) = self.take_buffered_frame()? {
                return Ok(Some(Received {
                    bytes,
                    origin: Origin::Active,
                }));
            }
            if let Some(datagram) = self.try_recv_datagram(&mut scratch)? {
                return Ok(Some(datagram));
            }
            match self.stream() {
                Some(stream) => {
                    if self.fill_from_stream(&stream, &mut scratch)? {
                        continue;
                    }
                }
                None => std::thread::sleep(STREAM_POLL_SLICE),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn close(&self) {
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        *self.peer.lock() = None;
        self.stream_buf.lock().clear();
    }

    fn is_connected(&self) -> bool {
        self.stream.lock().is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to resolve {0}")]
    Resolve(String),
    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("receive failed: {0}")]
    Receive(#[source] std::io::Error),
    #[error("server closed the connection")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("malformed stream data: {0}")]
    Malformed(String),
}
