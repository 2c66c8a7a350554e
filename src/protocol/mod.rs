//! The wire protocol: command set, framing, and dispatch results.
//!
//! Every on-wire message is a frame of `[cmd:u32 BE][len:u32 BE]`
//! followed by `len` payload bytes; all multi-byte integers inside
//! payloads are big-endian too. The command set is closed: an unknown
//! command or a length that disagrees with the command's declared
//! payload size draws a NAK and a hangup.
//!
//! Commands in the `0x00`–`0x0D` range form the play-phase state
//! machine. The `0x10`-range commands carry the connection handshake
//! (header, nickname, password, initial sync) and are only legal before
//! a connection is established; see [`crate::connection`].

pub mod codec;
pub mod messages;

use crate::error::{NetplayError, ProtocolErrorKind};

/// Protocol magic, sent first on every new connection.
pub const MAGIC: u32 = 0x524E_4554; // "RNET"

/// Protocol revision. Peers with a different revision are refused
/// during the handshake.
pub const PROTOCOL_VERSION: u32 = 3;

/// Bit set in an INPUT player tag when the sample carries the host's
/// authority: on the client receive path it advances the `server`
/// cursor, on the host send path it marks the host's own input.
pub const INPUT_TAG_FROM_HOST: u32 = 1 << 31;

/// Mask of the player slot bits in INPUT and MODE tags.
pub const TAG_SLOT_MASK: u32 = 0xFFFF;

/// MODE tag bit: this notification targets its recipient.
pub const MODE_TAG_YOU: u32 = 1 << 30;

/// MODE tag bit: the named player is joining the playing set (leaving
/// it when clear).
pub const MODE_TAG_PLAYING: u32 = 1 << 29;

/// The closed command set.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Informational acknowledgement; ignored on receipt.
    Ack = 0x00,
    /// Refusal; the receiver must disconnect.
    Nak = 0x01,
    /// Authoritative input for one (frame, player).
    Input = 0x02,
    /// Host had nothing to contribute for a frame.
    NoInput = 0x03,
    /// Toggle port mapping starting at a frame (host to client).
    FlipPlayers = 0x04,
    /// Ask to leave the playing set (client to host).
    Spectate = 0x05,
    /// Ask for a player slot (client to host).
    Play = 0x06,
    /// Slot assignment or membership notification (host to client).
    Mode = 0x07,
    /// Orderly close.
    Disconnect = 0x08,
    /// Sender's checksum for a frame.
    Crc = 0x09,
    /// Ask the host for a full state to resync.
    RequestSavestate = 0x0A,
    /// Compressed snapshot to apply at a frame.
    LoadSavestate = 0x0B,
    /// Sender paused; recipient stalls.
    Pause = 0x0C,
    /// Sender resumed.
    Resume = 0x0D,

    /// Handshake: protocol magic, revision, and connection flags.
    Hello = 0x10,
    /// Handshake: the peer's nickname.
    Nick = 0x11,
    /// Handshake: the shared secret, when the host demands one.
    Password = 0x12,
    /// Handshake: the host's session snapshot for a new peer.
    Sync = 0x13,
}

impl Command {
    /// Decodes a raw command word.
    #[must_use]
    pub fn from_wire(cmd: u32) -> Option<Command> {
        Some(match cmd {
            0x00 => Command::Ack,
            0x01 => Command::Nak,
            0x02 => Command::Input,
            0x03 => Command::NoInput,
            0x04 => Command::FlipPlayers,
            0x05 => Command::Spectate,
            0x06 => Command::Play,
            0x07 => Command::Mode,
            0x08 => Command::Disconnect,
            0x09 => Command::Crc,
            0x0A => Command::RequestSavestate,
            0x0B => Command::LoadSavestate,
            0x0C => Command::Pause,
            0x0D => Command::Resume,
            0x10 => Command::Hello,
            0x11 => Command::Nick,
            0x12 => Command::Password,
            0x13 => Command::Sync,
            _ => return None,
        })
    }

    /// The raw wire value.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// Whether this command belongs to the pre-connection handshake.
    #[must_use]
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Command::Hello | Command::Nick | Command::Password | Command::Sync
        )
    }
}

/// What a command handler decided.
///
/// Each command is handled independently; the session centralises the
/// bookkeeping that follows (flushing buffers, resetting timeouts,
/// NAKing and hanging up).
#[derive(Debug)]
pub enum HandlerOutcome {
    /// The command was consumed; keep draining.
    Handled,
    /// Not enough bytes buffered for a whole frame; the receive cursor
    /// stays at the last command boundary and parsing resumes next
    /// tick.
    ShortRead,
    /// The peer misbehaved: send NAK and hang it up.
    Nak(ProtocolErrorKind),
    /// The session cannot continue.
    Fatal(NetplayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_roundtrip() {
        for cmd in [
            Command::Ack,
            Command::Nak,
            Command::Input,
            Command::NoInput,
            Command::FlipPlayers,
            Command::Spectate,
            Command::Play,
            Command::Mode,
            Command::Disconnect,
            Command::Crc,
            Command::RequestSavestate,
            Command::LoadSavestate,
            Command::Pause,
            Command::Resume,
            Command::Hello,
            Command::Nick,
            Command::Password,
            Command::Sync,
        ] {
            assert_eq!(Command::from_wire(cmd.to_wire()), Some(cmd));
        }
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert_eq!(Command::from_wire(0x0E), None);
        assert_eq!(Command::from_wire(0x14), None);
        assert_eq!(Command::from_wire(0xFFFF_FFFF), None);
    }

    #[test]
    fn handshake_range() {
        assert!(Command::Hello.is_handshake());
        assert!(Command::Sync.is_handshake());
        assert!(!Command::Input.is_handshake());
    }

    #[test]
    fn mode_tag_bits_do_not_overlap_slot_mask() {
        assert_eq!(MODE_TAG_YOU & TAG_SLOT_MASK, 0);
        assert_eq!(MODE_TAG_PLAYING & TAG_SLOT_MASK, 0);
        assert_eq!(MODE_TAG_YOU & MODE_TAG_PLAYING, 0);
        assert_eq!(INPUT_TAG_FROM_HOST & TAG_SLOT_MASK, 0);
    }
}
