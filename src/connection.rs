//! Per-peer connection records and their buffered stream plumbing.
//!
//! Each peer owns a send buffer and a receive buffer around its byte
//! stream. Outbound messages are encoded into the send buffer and
//! flushed opportunistically; partial writes keep their tail for the
//! next tick. Inbound bytes accumulate until a whole frame is
//! decodable, so a short read never tears a command apart — the parser
//! simply resumes at the same boundary later.
//!
//! The lifecycle runs
//! `Init → PreNick → PrePassword → PreSync → Connected`,
//! with any phase able to drop straight to hangup. `PrePassword` is
//! skipped when the host demands no password. Playing versus
//! spectating is a mode tag on an established connection, not a
//! lifecycle phase.

use bytes::BytesMut;
use tracing::debug;

use crate::error::ProtocolErrorKind;
use crate::protocol::codec::{self, RawFrame};
use crate::protocol::messages::Message;
use crate::transport::{PeerStream, TryIo};
use crate::PeerMode;

/// Where a connection stands in its lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum HandshakePhase {
    /// No connection (initial state, and after hangup).
    #[default]
    None,
    /// Stream opened; waiting to exchange protocol headers.
    Init,
    /// Header accepted; waiting for the peer's nickname.
    PreNick,
    /// Nickname accepted; waiting for the password.
    PrePassword,
    /// Credentials accepted; waiting for the session snapshot.
    PreSync,
    /// Fully established.
    Connected,
}

impl HandshakePhase {
    /// Whether the connection is past its handshake.
    #[must_use]
    pub fn is_established(self) -> bool {
        matches!(self, HandshakePhase::Connected)
    }
}

/// One peer: its stream, buffers, and protocol bookkeeping.
#[derive(Debug)]
pub struct Connection<S> {
    stream: Option<S>,
    send_buf: BytesMut,
    recv_buf: BytesMut,
    /// Lifecycle phase.
    pub phase: HandshakePhase,
    /// Playing/spectating tag, meaningful once established.
    pub mode: PeerMode,
    /// The peer asked everyone to stall.
    pub paused: bool,
    /// Display name learned during the handshake.
    pub nick: String,
    /// The peer asked for a savestate; honoured at the next frame
    /// boundary so pending input is not overtaken by the state.
    pub wants_savestate: bool,
    /// The peer asked for a player slot; honoured at the next frame
    /// boundary so the assignment frame lines up with the input the
    /// peer has already seen.
    pub wants_play: bool,
}

/// What `pump_recv` observed on the stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// New bytes were buffered.
    Progress,
    /// Nothing to read right now.
    Idle,
    /// The peer closed the stream.
    Closed,
}

impl<S: PeerStream> Connection<S> {
    /// Wraps a freshly opened stream.
    #[must_use]
    pub fn new(stream: S) -> Self {
        Connection {
            stream: Some(stream),
            send_buf: BytesMut::new(),
            recv_buf: BytesMut::new(),
            phase: HandshakePhase::Init,
            mode: PeerMode::None,
            paused: false,
            nick: String::new(),
            wants_savestate: false,
            wants_play: false,
        }
    }

    /// Whether the connection still has a live stream.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// The peer's display name, or a placeholder before the handshake
    /// taught us one.
    #[must_use]
    pub fn display_nick(&self) -> String {
        if self.nick.is_empty() {
            "Anonymous".to_owned()
        } else {
            self.nick.clone()
        }
    }

    /// Encodes `msg` into the send buffer. Actual transmission happens
    /// on [`flush`](Self::flush).
    pub fn queue(&mut self, msg: &Message) {
        if self.stream.is_some() {
            msg.encode(&mut self.send_buf);
        }
    }

    /// Pushes as much of the send buffer as the stream will take.
    ///
    /// # Errors
    /// Propagates stream errors; `Closed` surfaces as
    /// `UnexpectedEof`. The caller hangs the connection up either way.
    pub fn flush(&mut self) -> std::io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while !self.send_buf.is_empty() {
            match stream.try_send(&self.send_buf)? {
                TryIo::Done(n) => {
                    let _ = self.send_buf.split_to(n);
                },
                TryIo::WouldBlock => break,
                TryIo::Closed => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed while sending",
                    ));
                },
            }
        }
        Ok(())
    }

    /// Reads everything currently available into the receive buffer.
    ///
    /// # Errors
    /// Propagates stream errors. EOF is reported as
    /// [`PumpOutcome::Closed`], not an error: an orderly shutdown is
    /// normal.
    pub fn pump_recv(&mut self) -> std::io::Result<PumpOutcome> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(PumpOutcome::Idle);
        };
        let mut chunk = [0u8; 4096];
        let mut progressed = false;
        loop {
            match stream.try_recv(&mut chunk)? {
                TryIo::Done(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    progressed = true;
                },
                TryIo::WouldBlock => {
                    return Ok(if progressed {
                        PumpOutcome::Progress
                    } else {
                        PumpOutcome::Idle
                    });
                },
                TryIo::Closed => return Ok(PumpOutcome::Closed),
            }
        }
    }

    /// Splits the next whole frame off the receive buffer, if one is
    /// fully buffered.
    ///
    /// # Errors
    /// A frame whose claimed length exceeds `max_payload` is a
    /// protocol violation.
    pub fn next_frame(
        &mut self,
        max_payload: usize,
    ) -> Result<Option<RawFrame>, ProtocolErrorKind> {
        codec::try_decode_frame(&mut self.recv_buf, max_payload)
    }

    /// Closes the socket, frees both buffers, and resets the record.
    pub fn hangup(&mut self) {
        if self.stream.is_some() {
            debug!(nick = %self.display_nick(), "hangup");
        }
        self.stream = None;
        self.send_buf = BytesMut::new();
        self.recv_buf = BytesMut::new();
        self.phase = HandshakePhase::None;
        self.mode = PeerMode::None;
        self.paused = false;
        self.wants_savestate = false;
        self.wants_play = false;
    }

    /// Bytes waiting to be transmitted (test inspection).
    #[must_use]
    pub fn send_backlog(&self) -> usize {
        self.send_buf.len()
    }
}
