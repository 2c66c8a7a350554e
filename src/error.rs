//! Error types for the netplay core.
//!
//! Errors are structured enums with numeric fields rather than
//! formatted strings: construction on the hot path allocates nothing,
//! callers can match on the specific failure, and the message is
//! rendered lazily by `Display` only when somebody looks at it.
//!
//! The taxonomy follows the session's recovery policy:
//!
//! - [`NetplayError::Transport`] — a socket failed or hit EOF; the
//!   affected connection is hung up and the session continues with the
//!   surviving peers.
//! - [`NetplayError::Protocol`] — a peer sent something malformed or
//!   illegal; a NAK is sent and that peer is hung up.
//! - [`NetplayError::StateInit`] — the emulator core refused to reveal
//!   its state size or to serialize; the session degrades to
//!   no-savestate operation instead of failing.
//! - [`NetplayError::Stall`] — remote input stopped arriving for
//!   `MAX_RETRIES × RETRY_MS` with no peer paused; the embedding
//!   frontend decides whether to tear the session down.
//! - [`NetplayError::Fatal`] — the session cannot continue at all
//!   (zero-sized ring, allocation failure).

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerSlot};

/// Why a peer's traffic violated the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ProtocolErrorKind {
    /// The command word is not in the command set.
    UnknownCommand {
        /// The raw command word received.
        cmd: u32,
    },
    /// The length field disagrees with the command's declared payload
    /// size.
    BadPayloadLength {
        /// The raw command word received.
        cmd: u32,
        /// The length the peer claimed.
        claimed: u32,
        /// The length the command requires.
        expected: u32,
    },
    /// An INPUT arrived for a frame later than the next expected one.
    InputOutOfOrder {
        /// The slot the input claimed.
        slot: PlayerSlot,
        /// The frame the input claimed.
        frame: Frame,
        /// The frame we were expecting next.
        expected: Frame,
    },
    /// An INPUT claimed a slot its sender does not hold.
    InputWrongSlot {
        /// The slot the input claimed.
        slot: PlayerSlot,
    },
    /// A FLIP_PLAYERS named a frame before the host-acknowledged
    /// horizon.
    FlipBeforeServerFrame {
        /// The flip frame the host named.
        flip_frame: Frame,
        /// Our server cursor at the time.
        server_frame: Frame,
    },
    /// A MODE notification failed validation before any state change.
    IllegalModeChange {
        /// The frame the notification named.
        frame: Frame,
    },
    /// A savestate's claimed frame or size did not match the session.
    BadSavestate {
        /// The frame the savestate named.
        frame: Frame,
    },
    /// The peer refused one of our commands.
    PeerSentNak,
    /// A command arrived that only the other role may send.
    WrongDirection {
        /// The raw command word received.
        cmd: u32,
    },
}

impl Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand { cmd } => {
                write!(f, "unknown command 0x{cmd:08x}")
            },
            Self::BadPayloadLength {
                cmd,
                claimed,
                expected,
            } => {
                write!(
                    f,
                    "command 0x{cmd:08x} claimed {claimed} payload bytes, expected {expected}"
                )
            },
            Self::InputOutOfOrder {
                slot,
                frame,
                expected,
            } => {
                write!(
                    f,
                    "input for player {slot} arrived at frame {frame}, expected {expected}"
                )
            },
            Self::InputWrongSlot { slot } => {
                write!(f, "input claimed player slot {slot} the sender does not hold")
            },
            Self::FlipBeforeServerFrame {
                flip_frame,
                server_frame,
            } => {
                write!(
                    f,
                    "flip at frame {flip_frame} is before the acknowledged frame {server_frame}"
                )
            },
            Self::IllegalModeChange { frame } => {
                write!(f, "illegal mode change at frame {frame}")
            },
            Self::BadSavestate { frame } => {
                write!(f, "savestate for frame {frame} failed validation")
            },
            Self::PeerSentNak => write!(f, "peer refused a command"),
            Self::WrongDirection { cmd } => {
                write!(f, "command 0x{cmd:08x} sent in the wrong direction")
            },
        }
    }
}

/// Why a handshake failed before the connection became established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum HandshakeErrorKind {
    /// The first bytes were not our protocol magic.
    BadMagic {
        /// The magic the peer sent.
        got: u32,
    },
    /// The peer speaks a different protocol revision.
    VersionMismatch {
        /// The version the peer sent.
        theirs: u32,
        /// The version we speak.
        ours: u32,
    },
    /// The password did not match.
    BadPassword,
    /// The peer's session parameters disagree with ours.
    ParameterMismatch {
        /// Which parameter disagreed.
        field: &'static str,
    },
    /// A command arrived that is not legal in the current phase.
    UnexpectedCommand {
        /// The raw command word received.
        cmd: u32,
    },
}

impl Display for HandshakeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic { got } => write!(f, "bad protocol magic 0x{got:08x}"),
            Self::VersionMismatch { theirs, ours } => {
                write!(f, "peer speaks protocol version {theirs}, we speak {ours}")
            },
            Self::BadPassword => write!(f, "password rejected"),
            Self::ParameterMismatch { field } => {
                write!(f, "session parameter '{field}' disagrees with the host")
            },
            Self::UnexpectedCommand { cmd } => {
                write!(f, "command 0x{cmd:08x} is not legal during the handshake")
            },
        }
    }
}

/// Why a session could not be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SetupErrorKind {
    /// `delay_frames` must be at least 1 (the ring needs 2·DF+1 > 1
    /// slots).
    ZeroDelayFrames,
    /// `check_frames` must be at least 1.
    ZeroCheckFrames,
    /// `words_per_frame` must be at least 1.
    ZeroInputWords,
    /// The nickname exceeds the wire field.
    NickTooLong {
        /// Byte length of the offending nickname.
        len: usize,
    },
    /// NAT traversal was requested on a client session.
    NatTraversalOnClient,
}

impl Display for SetupErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroDelayFrames => write!(f, "delay_frames must be at least 1"),
            Self::ZeroCheckFrames => write!(f, "check_frames must be at least 1"),
            Self::ZeroInputWords => write!(f, "words_per_frame must be at least 1"),
            Self::NickTooLong { len } => {
                write!(f, "nickname of {len} bytes exceeds the {} byte field", crate::NICK_LEN)
            },
            Self::NatTraversalOnClient => {
                write!(f, "NAT traversal is a host-only option")
            },
        }
    }
}

/// Top-level error for all public session operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum NetplayError {
    /// A socket operation failed or the stream reached EOF. The
    /// affected connection has been hung up.
    Transport {
        /// The nickname of the affected peer, if the handshake got far
        /// enough to learn it.
        nick: Option<String>,
        /// The underlying I/O error.
        source: std::io::Error,
    },
    /// A peer violated the protocol and has been NAKed and hung up.
    Protocol {
        /// What the peer did wrong.
        kind: ProtocolErrorKind,
    },
    /// A handshake failed and the connection has been dropped.
    Handshake {
        /// What went wrong.
        kind: HandshakeErrorKind,
    },
    /// The emulator core would not initialise serialization; the
    /// session continues without savestates or rollback.
    StateInit,
    /// Remote input stopped arriving and no peer is paused.
    Stall {
        /// The frame the session is stuck waiting to complete.
        frame: Frame,
    },
    /// A session construction parameter was rejected.
    Setup {
        /// Which parameter and why.
        kind: SetupErrorKind,
    },
    /// The session cannot continue.
    Fatal {
        /// A description of the unrecoverable condition.
        context: &'static str,
    },
}

impl Display for NetplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { nick, source } => match nick {
                Some(nick) => write!(f, "transport failure for '{nick}': {source}"),
                None => write!(f, "transport failure: {source}"),
            },
            Self::Protocol { kind } => write!(f, "protocol violation: {kind}"),
            Self::Handshake { kind } => write!(f, "handshake failed: {kind}"),
            Self::StateInit => {
                write!(f, "emulator core refused serialization; savestates disabled")
            },
            Self::Stall { frame } => {
                write!(f, "stalled waiting for remote input at frame {frame}")
            },
            Self::Setup { kind } => write!(f, "invalid session parameter: {kind}"),
            Self::Fatal { context } => write!(f, "fatal: {context}"),
        }
    }
}

impl Error for NetplayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ProtocolErrorKind> for NetplayError {
    fn from(kind: ProtocolErrorKind) -> Self {
        Self::Protocol { kind }
    }
}

impl From<HandshakeErrorKind> for NetplayError {
    fn from(kind: HandshakeErrorKind) -> Self {
        Self::Handshake { kind }
    }
}

impl From<SetupErrorKind> for NetplayError {
    fn from(kind: SetupErrorKind) -> Self {
        Self::Setup { kind }
    }
}
