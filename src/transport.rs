//! Byte-stream transport for peer connections.
//!
//! The protocol requires an ordered, reliable byte stream per peer and
//! nothing else. [`PeerStream`] is that contract: non-blocking send and
//! receive over some framed-by-us pipe. Production sessions run over
//! TCP with Nagle disabled; tests run over in-memory pipes so two
//! sessions can talk inside one thread with no sockets at all.
//!
//! The session core never blocks on a stream. It polls every live
//! stream each tick and, when asked to block for missing input, sleeps
//! in short slices between polls up to the retry window.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tracing::debug;

/// Poll slice while waiting for readiness, in milliseconds.
pub(crate) const POLL_SLICE_MS: u64 = 1;

/// Result of a non-blocking stream operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TryIo {
    /// `n` bytes were moved.
    Done(usize),
    /// The operation would block; try again next tick.
    WouldBlock,
    /// The peer closed the stream.
    Closed,
}

/// An ordered, reliable, non-blocking byte stream to one peer.
pub trait PeerStream {
    /// Attempts to queue `bytes` for sending. Partial writes are
    /// normal; the caller keeps the unsent tail buffered.
    fn try_send(&mut self, bytes: &[u8]) -> io::Result<TryIo>;

    /// Attempts to read into `buf`.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<TryIo>;
}

/// Accepts inbound [`PeerStream`]s on the host side.
pub trait StreamListener {
    /// The stream type produced by this listener.
    type Stream: PeerStream;

    /// Accepts one pending connection, if any.
    fn try_accept(&mut self) -> io::Result<Option<Self::Stream>>;
}

// ############
// #   TCP    #
// ############

/// A non-blocking TCP stream with the session's socket options applied:
/// `TCP_NODELAY` (the protocol sends many small frames and cannot
/// afford Nagle) and `CLOEXEC` where the platform has it.
#[derive(Debug)]
pub struct TcpPeerStream {
    stream: TcpStream,
}

impl TcpPeerStream {
    /// Dials `addr` and configures the stream.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }

    /// Adopts an already-connected stream (e.g. fresh from `accept`).
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        #[cfg(unix)]
        {
            let sock = socket2::SockRef::from(&stream);
            sock.set_cloexec(true)?;
        }
        Ok(TcpPeerStream { stream })
    }
}

impl PeerStream for TcpPeerStream {
    fn try_send(&mut self, bytes: &[u8]) -> io::Result<TryIo> {
        match self.stream.write(bytes) {
            Ok(0) => Ok(TryIo::Closed),
            Ok(n) => Ok(TryIo::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(TryIo::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(TryIo::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<TryIo> {
        match self.stream.read(buf) {
            Ok(0) => Ok(TryIo::Closed),
            Ok(n) => Ok(TryIo::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(TryIo::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(TryIo::WouldBlock),
            Err(e) => Err(e),
        }
    }
}

/// The host's listening socket.
///
/// Binds IPv6 when the platform allows it and clears `IPV6_V6ONLY` so
/// IPv4 clients are accepted on the same socket, falling back to plain
/// IPv4 otherwise. The backlog is one: the session drains at most one
/// pending connection per tick anyway.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Binds the session's listening port.
    pub fn bind(port: u16) -> io::Result<Self> {
        let listener = match Self::bind_dual_stack(port) {
            Ok(listener) => listener,
            Err(e) => {
                debug!(port, error = %e, "dual-stack bind failed, retrying as IPv4");
                Self::bind_v4(port)?
            },
        };
        listener.set_nonblocking(true)?;
        Ok(TcpAcceptor { listener })
    }

    fn bind_dual_stack(port: u16) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV6, Type::STREAM, None)?;
        socket.set_only_v6(false)?;
        #[cfg(unix)]
        socket.set_cloexec(true)?;
        socket.set_reuse_address(true)?;
        let addr: SocketAddr = (std::net::Ipv6Addr::UNSPECIFIED, port).into();
        socket.bind(&addr.into())?;
        socket.listen(1)?;
        Ok(socket.into())
    }

    fn bind_v4(port: u16) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        #[cfg(unix)]
        socket.set_cloexec(true)?;
        socket.set_reuse_address(true)?;
        let addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
        socket.bind(&addr.into())?;
        socket.listen(1)?;
        Ok(socket.into())
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl StreamListener for TcpAcceptor {
    type Stream = TcpPeerStream;

    fn try_accept(&mut self) -> io::Result<Option<TcpPeerStream>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted connection");
                Ok(Some(TcpPeerStream::from_stream(stream)?))
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ############
// #  MEMORY  #
// ############

#[derive(Debug, Default)]
struct Pipe {
    data: BytesMut,
    closed: bool,
}

/// An in-memory bidirectional stream, for driving two sessions against
/// each other in tests without sockets.
#[derive(Debug, Clone)]
pub struct MemoryStream {
    incoming: Arc<Mutex<Pipe>>,
    outgoing: Arc<Mutex<Pipe>>,
}

impl MemoryStream {
    /// Creates a connected pair; bytes sent on one end arrive on the
    /// other.
    #[must_use]
    pub fn pair() -> (MemoryStream, MemoryStream) {
        let a = Arc::new(Mutex::new(Pipe::default()));
        let b = Arc::new(Mutex::new(Pipe::default()));
        (
            MemoryStream {
                incoming: a.clone(),
                outgoing: b.clone(),
            },
            MemoryStream {
                incoming: b,
                outgoing: a,
            },
        )
    }

    /// Closes the stream; the other end sees EOF after draining.
    pub fn close(&self) {
        self.incoming.lock().closed = true;
        self.outgoing.lock().closed = true;
    }

    /// Bytes queued towards the other end (test inspection).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.outgoing.lock().data.len()
    }
}

impl PeerStream for MemoryStream {
    fn try_send(&mut self, bytes: &[u8]) -> io::Result<TryIo> {
        let mut pipe = self.outgoing.lock();
        if pipe.closed {
            return Ok(TryIo::Closed);
        }
        pipe.data.extend_from_slice(bytes);
        Ok(TryIo::Done(bytes.len()))
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<TryIo> {
        let mut pipe = self.incoming.lock();
        if pipe.data.is_empty() {
            return if pipe.closed {
                Ok(TryIo::Closed)
            } else {
                Ok(TryIo::WouldBlock)
            };
        }
        let n = pipe.data.len().min(buf.len());
        buf[..n].copy_from_slice(&pipe.data.split_to(n));
        Ok(TryIo::Done(n))
    }
}

/// A listener fed by hand in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryListener {
    pending: Arc<Mutex<Vec<MemoryStream>>>,
}

impl MemoryListener {
    /// Creates an empty listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a client end for the next `try_accept`.
    pub fn push(&self, stream: MemoryStream) {
        self.pending.lock().push(stream);
    }
}

impl StreamListener for MemoryListener {
    type Stream = MemoryStream;

    fn try_accept(&mut self) -> io::Result<Option<MemoryStream>> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            Ok(None)
        } else {
            Ok(Some(pending.remove(0)))
        }
    }
}
