//! Session construction.
//!
//! [`SessionBuilder`] collects and validates every session parameter
//! before anything touches the network or the emulator core. Hosting
//! and dialing share one builder: leaving the server address unset
//! makes the session the host.
//!
//! ```no_run
//! use rollnet::SessionBuilder;
//! # struct Core;
//! # impl rollnet::EmulatorCore for Core {
//! #     fn serialize_size(&mut self) -> usize { 8 }
//! #     fn serialize(&mut self, b: &mut [u8]) -> bool { true }
//! #     fn unserialize(&mut self, b: &[u8]) -> bool { true }
//! #     fn run(&mut self, _: &rollnet::ResolvedInputs<'_>) {}
//! # }
//! # let mut core = Core;
//! let mut session = SessionBuilder::new()
//!     .with_port(55435)
//!     .with_delay_frames(4)
//!     .with_check_frames(30)
//!     .with_nick("kay")
//!     .start(&mut core)?;
//! # Ok::<(), rollnet::NetplayError>(())
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{NetplayError, SetupErrorKind};
use crate::frame_ring::FrameRing;
use crate::savestate::{self, Lz4Compressor, StateCompressor};
use crate::session::session::{NetplaySession, Role};
use crate::transport::{PeerStream, StreamListener, TcpAcceptor, TcpPeerStream};
use crate::{
    EmulatorCore, Quirks, DEFAULT_DIRECTIONAL_MASK, DEFAULT_WORDS_PER_FRAME, NICK_LEN,
};

/// Builder for [`NetplaySession`].
pub struct SessionBuilder {
    direct_host: Option<SocketAddr>,
    server: Option<String>,
    port: u16,
    password: Option<String>,
    delay_frames: u32,
    check_frames: u32,
    nat_traversal: bool,
    nick: String,
    quirks: Quirks,
    words_per_frame: usize,
    directional_mask: u32,
    playing: bool,
    autosave: Option<Arc<Mutex<()>>>,
    compressor: Option<Box<dyn StateCompressor>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// A builder with the defaults: host a 2-delay-frame playing
    /// session on port 55435, checksum every 60 frames.
    #[must_use]
    pub fn new() -> Self {
        SessionBuilder {
            direct_host: None,
            server: None,
            port: 55435,
            password: None,
            delay_frames: 2,
            check_frames: 60,
            nat_traversal: false,
            nick: String::new(),
            quirks: Quirks::empty(),
            words_per_frame: DEFAULT_WORDS_PER_FRAME,
            directional_mask: DEFAULT_DIRECTIONAL_MASK,
            playing: true,
            autosave: None,
            compressor: None,
        }
    }

    /// Dials a pre-resolved peer address, bypassing name resolution.
    #[must_use]
    pub fn with_direct_host(mut self, addr: SocketAddr) -> Self {
        self.direct_host = Some(addr);
        self
    }

    /// Dials `server` instead of hosting.
    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// TCP port to listen on (host) or dial (client).
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Shared secret validated during the handshake.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// The session delay budget `DF`; the ring holds `2·DF + 1` frames.
    #[must_use]
    pub fn with_delay_frames(mut self, delay_frames: u32) -> Self {
        self.delay_frames = delay_frames;
        self
    }

    /// CRC broadcast period, in frames.
    #[must_use]
    pub fn with_check_frames(mut self, check_frames: u32) -> Self {
        self.check_frames = check_frames;
        self
    }

    /// Host only: attempt NAT punch-through. The traversal machinery
    /// itself lives outside this crate; the session merely records the
    /// request for the embedding frontend.
    #[must_use]
    pub fn with_nat_traversal(mut self, nat_traversal: bool) -> Self {
        self.nat_traversal = nat_traversal;
        self
    }

    /// Local display name, at most [`NICK_LEN`] bytes.
    #[must_use]
    pub fn with_nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = nick.into();
        self
    }

    /// Pre-recorded emulator-core quirks.
    #[must_use]
    pub fn with_quirks(mut self, quirks: Quirks) -> Self {
        self.quirks = quirks;
        self
    }

    /// 32-bit words per input sample; must agree across the session.
    #[must_use]
    pub fn with_words_per_frame(mut self, words: usize) -> Self {
        self.words_per_frame = words;
        self
    }

    /// Which bits of input word 0 are directional (held) rather than
    /// edge-triggered; used by resimulation.
    #[must_use]
    pub fn with_directional_mask(mut self, mask: u32) -> Self {
        self.directional_mask = mask;
        self
    }

    /// Whether the local participant wants a player slot (true) or to
    /// spectate (false).
    #[must_use]
    pub fn with_playing(mut self, playing: bool) -> Self {
        self.playing = playing;
        self
    }

    /// The frontend's autosave interlock; held around every
    /// emulator-core `run`, `serialize`, and `unserialize`.
    #[must_use]
    pub fn with_autosave_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.autosave = Some(lock);
        self
    }

    /// Replaces the LZ4 default compression backend.
    #[must_use]
    pub fn with_compressor(mut self, compressor: Box<dyn StateCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    fn validate(&self) -> Result<(), NetplayError> {
        if self.delay_frames == 0 {
            return Err(SetupErrorKind::ZeroDelayFrames.into());
        }
        if self.check_frames == 0 {
            return Err(SetupErrorKind::ZeroCheckFrames.into());
        }
        if self.words_per_frame == 0 {
            return Err(SetupErrorKind::ZeroInputWords.into());
        }
        if self.nick.len() > NICK_LEN {
            return Err(SetupErrorKind::NickTooLong {
                len: self.nick.len(),
            }
            .into());
        }
        let is_client = self.server.is_some() || self.direct_host.is_some();
        if self.nat_traversal && is_client {
            return Err(SetupErrorKind::NatTraversalOnClient.into());
        }
        Ok(())
    }

    /// Works out the serialized state size, running a quirky core for
    /// a while if needed. A refusal degrades the session to
    /// no-savestate operation instead of failing construction.
    fn probe_state_size<C: EmulatorCore>(
        &mut self,
        core: &mut C,
        autosave: &Mutex<()>,
    ) -> usize {
        if self.quirks.contains(Quirks::NO_SAVESTATES) {
            return 0;
        }
        match savestate::init_serialization(core, autosave) {
            Ok(size) => size,
            Err(_) => {
                self.quirks.set(Quirks::NO_SAVESTATES);
                0
            },
        }
    }

    fn build<S: PeerStream>(
        mut self,
        role: Role,
        listener: Option<Box<dyn StreamListener<Stream = S>>>,
        connections: Vec<Connection<S>>,
        state_size: usize,
        autosave: Arc<Mutex<()>>,
    ) -> Result<NetplaySession<S>, NetplayError> {
        let ring = FrameRing::new(self.delay_frames, self.words_per_frame)?;
        if self.nick.is_empty() {
            self.nick = "Anonymous".to_owned();
        }
        Ok(NetplaySession::new(
            role,
            listener,
            connections,
            ring,
            self.check_frames,
            self.directional_mask,
            self.password,
            self.nick,
            self.nat_traversal,
            self.playing,
            self.quirks,
            state_size,
            autosave,
            self.compressor
                .unwrap_or_else(|| Box::new(Lz4Compressor)),
        ))
    }

    /// Starts a TCP session: listens when no server was named, dials
    /// otherwise.
    pub fn start<C: EmulatorCore>(
        mut self,
        core: &mut C,
    ) -> Result<NetplaySession<TcpPeerStream>, NetplayError> {
        self.validate()?;
        let autosave = self.autosave.take().unwrap_or_default();
        let state_size = self.probe_state_size(core, &autosave);

        let dial_addr = match (self.direct_host, self.server.as_deref()) {
            (Some(addr), _) => Some(addr),
            (None, Some(server)) => {
                let mut addrs =
                    (server, self.port)
                        .to_socket_addrs()
                        .map_err(|source| NetplayError::Transport {
                            nick: None,
                            source,
                        })?;
                Some(addrs.next().ok_or(NetplayError::Fatal {
                    context: "server name resolved to no addresses",
                })?)
            },
            (None, None) => None,
        };

        match dial_addr {
            None => {
                let acceptor =
                    TcpAcceptor::bind(self.port).map_err(|source| NetplayError::Transport {
                        nick: None,
                        source,
                    })?;
                debug!(port = self.port, "hosting");
                self.build(Role::Host, Some(Box::new(acceptor)), Vec::new(), state_size, autosave)
            },
            Some(addr) => {
                let stream =
                    TcpPeerStream::connect(addr).map_err(|source| NetplayError::Transport {
                        nick: None,
                        source,
                    })?;
                debug!(%addr, "dialing");
                let connections = vec![Connection::new(stream)];
                self.build(Role::Client, None, connections, state_size, autosave)
            },
        }
    }

    /// Starts a host session over a caller-supplied listener. This is
    /// how tests drive sessions over in-memory streams.
    pub fn start_host_with<S, L, C>(
        mut self,
        listener: L,
        core: &mut C,
    ) -> Result<NetplaySession<S>, NetplayError>
    where
        S: PeerStream,
        L: StreamListener<Stream = S> + 'static,
        C: EmulatorCore,
    {
        self.validate()?;
        let autosave = self.autosave.take().unwrap_or_default();
        let state_size = self.probe_state_size(core, &autosave);
        self.build(
            Role::Host,
            Some(Box::new(listener)),
            Vec::new(),
            state_size,
            autosave,
        )
    }

    /// Starts a client session over a caller-supplied stream.
    pub fn start_client_with<S, C>(
        mut self,
        stream: S,
        core: &mut C,
    ) -> Result<NetplaySession<S>, NetplayError>
    where
        S: PeerStream,
        C: EmulatorCore,
    {
        self.validate()?;
        let autosave = self.autosave.take().unwrap_or_default();
        let state_size = self.probe_state_size(core, &autosave);
        let connections = vec![Connection::new(stream)];
        self.build(Role::Client, None, connections, state_size, autosave)
    }
}
