//! Typed wire messages and their payload layouts.
//!
//! [`Message`] is the parsed form of one wire frame. Parsing validates
//! the command word and the exact payload length before anything else
//! looks at the bytes; handlers therefore never see a half-formed
//! message and never mutate session state for traffic that will be
//! refused.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use super::codec::{self, PayloadReader, RawFrame};
use super::{
    Command, INPUT_TAG_FROM_HOST, MODE_TAG_PLAYING, MODE_TAG_YOU, TAG_SLOT_MASK,
};
use crate::error::ProtocolErrorKind;
use crate::{Frame, InputWords, PlayerSlot, SlotSet, NICK_LEN};

/// The player tag carried by INPUT: the slot in the low bits and the
/// host-authority sentinel in bit 31.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InputTag {
    /// The player slot the sample is for.
    pub slot: PlayerSlot,
    /// Set when the sample carries the host's authority.
    pub from_host: bool,
}

impl InputTag {
    /// Encodes the tag to its wire word.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        let mut tag = u32::from(self.slot.as_u8());
        if self.from_host {
            tag |= INPUT_TAG_FROM_HOST;
        }
        tag
    }

    /// Decodes a wire word. Slot bits above the valid range are kept
    /// (validation is the handler's call, so the error can name them).
    #[must_use]
    pub fn from_wire(tag: u32) -> InputTag {
        InputTag {
            slot: PlayerSlot::new((tag & TAG_SLOT_MASK) as u8),
            from_host: tag & INPUT_TAG_FROM_HOST != 0,
        }
    }
}

/// The mode tag carried by MODE: slot in the low 16 bits, `YOU` in bit
/// 30, `PLAYING` in bit 29.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ModeTag {
    /// The player slot the notification is about.
    pub slot: PlayerSlot,
    /// The notification targets its recipient.
    pub you: bool,
    /// The named player is joining the playing set (leaving when
    /// false).
    pub playing: bool,
}

impl ModeTag {
    /// Encodes the tag to its wire word.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        let mut tag = u32::from(self.slot.as_u8());
        if self.you {
            tag |= MODE_TAG_YOU;
        }
        if self.playing {
            tag |= MODE_TAG_PLAYING;
        }
        tag
    }

    /// Decodes a wire word.
    #[must_use]
    pub fn from_wire(tag: u32) -> ModeTag {
        ModeTag {
            slot: PlayerSlot::new((tag & TAG_SLOT_MASK) as u8),
            you: tag & MODE_TAG_YOU != 0,
            playing: tag & MODE_TAG_PLAYING != 0,
        }
    }
}

/// HELLO flag: the host requires a password.
pub const HELLO_FLAG_PASSWORD: u32 = 1;

/// SYNC flag: the port mapping is currently flipped.
pub const SYNC_FLAG_FLIPPED: u32 = 1;

/// A parsed wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Informational; ignored.
    Ack,
    /// Refusal; receiver must disconnect.
    Nak,
    /// Authoritative input for one (frame, player).
    Input {
        /// The frame the sample is for.
        frame: Frame,
        /// Slot and authority bits.
        tag: InputTag,
        /// The input words, `words_per_frame` of them.
        words: InputWords,
    },
    /// Host had nothing to contribute for `frame`.
    NoInput {
        /// The frame the host skipped.
        frame: Frame,
    },
    /// Toggle the port mapping starting at `frame`.
    FlipPlayers {
        /// First frame under the flipped mapping.
        frame: Frame,
    },
    /// Ask to leave the playing set.
    Spectate,
    /// Ask for a player slot.
    Play,
    /// Membership notification.
    Mode {
        /// The frame the change takes effect.
        frame: Frame,
        /// Who and how.
        tag: ModeTag,
    },
    /// Orderly close.
    Disconnect,
    /// The sender's checksum for `frame`.
    Crc {
        /// The checked frame.
        frame: Frame,
        /// Its CRC-32.
        crc: u32,
    },
    /// Ask for a full state to resync.
    RequestSavestate,
    /// Compressed snapshot to apply at `frame`.
    LoadSavestate {
        /// The frame the snapshot belongs to.
        frame: Frame,
        /// Decompressed size; must equal the session's state size.
        inflated_len: u32,
        /// The compressed bytes.
        zbytes: Bytes,
    },
    /// Sender paused.
    Pause,
    /// Sender resumed.
    Resume,

    /// Handshake header.
    Hello {
        /// Protocol magic.
        magic: u32,
        /// Protocol revision.
        version: u32,
        /// [`HELLO_FLAG_PASSWORD`] and friends.
        flags: u32,
    },
    /// Handshake nickname (NUL-padded to [`NICK_LEN`]).
    Nick {
        /// The nickname.
        nick: String,
    },
    /// Handshake password (NUL-padded to [`NICK_LEN`]).
    Password {
        /// The shared secret.
        password: String,
    },
    /// Handshake session snapshot from the host.
    Sync {
        /// The host's current frame; the new peer starts here.
        frame: Frame,
        /// Players currently in the playing set.
        connected: SlotSet,
        /// [`SYNC_FLAG_FLIPPED`] and friends.
        flags: u32,
        /// The frame the flip took effect, when flipped.
        flip_frame: Frame,
        /// Input words per frame; must match the client's.
        words_per_frame: u32,
        /// The core's serialized size, 0 when not yet known.
        state_size: u32,
    },
}

impl Message {
    /// The command word this message travels under.
    #[must_use]
    pub fn command(&self) -> Command {
        match self {
            Message::Ack => Command::Ack,
            Message::Nak => Command::Nak,
            Message::Input { .. } => Command::Input,
            Message::NoInput { .. } => Command::NoInput,
            Message::FlipPlayers { .. } => Command::FlipPlayers,
            Message::Spectate => Command::Spectate,
            Message::Play => Command::Play,
            Message::Mode { .. } => Command::Mode,
            Message::Disconnect => Command::Disconnect,
            Message::Crc { .. } => Command::Crc,
            Message::RequestSavestate => Command::RequestSavestate,
            Message::LoadSavestate { .. } => Command::LoadSavestate,
            Message::Pause => Command::Pause,
            Message::Resume => Command::Resume,
            Message::Hello { .. } => Command::Hello,
            Message::Nick { .. } => Command::Nick,
            Message::Password { .. } => Command::Password,
            Message::Sync { .. } => Command::Sync,
        }
    }

    /// Appends this message, fully framed, to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        let mut payload = BytesMut::new();
        match self {
            Message::Ack
            | Message::Nak
            | Message::Spectate
            | Message::Play
            | Message::Disconnect
            | Message::RequestSavestate
            | Message::Pause
            | Message::Resume => {},
            Message::Input { frame, tag, words } => {
                payload.put_u32(frame.as_u32());
                payload.put_u32(tag.to_wire());
                for word in words {
                    payload.put_u32(*word);
                }
            },
            Message::NoInput { frame } | Message::FlipPlayers { frame } => {
                payload.put_u32(frame.as_u32());
            },
            Message::Mode { frame, tag } => {
                payload.put_u32(frame.as_u32());
                payload.put_u32(tag.to_wire());
            },
            Message::Crc { frame, crc } => {
                payload.put_u32(frame.as_u32());
                payload.put_u32(*crc);
            },
            Message::LoadSavestate {
                frame,
                inflated_len,
                zbytes,
            } => {
                payload.put_u32(frame.as_u32());
                payload.put_u32(*inflated_len);
                payload.put_slice(zbytes);
            },
            Message::Hello {
                magic,
                version,
                flags,
            } => {
                payload.put_u32(*magic);
                payload.put_u32(*version);
                payload.put_u32(*flags);
            },
            Message::Nick { nick } => {
                codec::put_padded_str(&mut payload, nick, NICK_LEN);
            },
            Message::Password { password } => {
                codec::put_padded_str(&mut payload, password, NICK_LEN);
            },
            Message::Sync {
                frame,
                connected,
                flags,
                flip_frame,
                words_per_frame,
                state_size,
            } => {
                payload.put_u32(frame.as_u32());
                payload.put_u32(u32::from(connected.bits()));
                payload.put_u32(*flags);
                payload.put_u32(flip_frame.as_u32());
                payload.put_u32(*words_per_frame);
                payload.put_u32(*state_size);
            },
        }
        codec::encode_frame(self.command().to_wire(), &payload, out);
    }

    /// Parses a raw frame into a typed message.
    ///
    /// `words_per_frame` fixes the expected INPUT payload size for this
    /// session. Every fixed-size command is checked for an exact length
    /// match; LOAD_SAVESTATE only has a lower bound here, its upper
    /// bound being enforced by the framing layer's payload cap.
    pub fn parse(raw: RawFrame, words_per_frame: usize) -> Result<Message, ProtocolErrorKind> {
        let Some(command) = Command::from_wire(raw.cmd) else {
            return Err(ProtocolErrorKind::UnknownCommand { cmd: raw.cmd });
        };
        let expect = |expected: usize| -> Result<(), ProtocolErrorKind> {
            if raw.payload.len() == expected {
                Ok(())
            } else {
                Err(ProtocolErrorKind::BadPayloadLength {
                    cmd: raw.cmd,
                    claimed: raw.payload.len() as u32,
                    expected: expected as u32,
                })
            }
        };
        let cmd = raw.cmd;
        let mut reader = PayloadReader::new(raw.payload.clone());
        let short = ProtocolErrorKind::BadPayloadLength {
            cmd,
            claimed: raw.payload.len() as u32,
            expected: 8,
        };

        Ok(match command {
            Command::Ack => {
                expect(0)?;
                Message::Ack
            },
            Command::Nak => {
                expect(0)?;
                Message::Nak
            },
            Command::Spectate => {
                expect(0)?;
                Message::Spectate
            },
            Command::Play => {
                expect(0)?;
                Message::Play
            },
            Command::Disconnect => {
                expect(0)?;
                Message::Disconnect
            },
            Command::RequestSavestate => {
                expect(0)?;
                Message::RequestSavestate
            },
            Command::Pause => {
                expect(0)?;
                Message::Pause
            },
            Command::Resume => {
                expect(0)?;
                Message::Resume
            },
            Command::Input => {
                expect(8 + 4 * words_per_frame)?;
                let frame = Frame::new(reader.u32().ok_or(short)?);
                let tag = InputTag::from_wire(reader.u32().ok_or(short)?);
                let mut words: InputWords = SmallVec::with_capacity(words_per_frame);
                for _ in 0..words_per_frame {
                    words.push(reader.u32().ok_or(short)?);
                }
                Message::Input { frame, tag, words }
            },
            Command::NoInput => {
                expect(4)?;
                Message::NoInput {
                    frame: Frame::new(reader.u32().ok_or(short)?),
                }
            },
            Command::FlipPlayers => {
                expect(4)?;
                Message::FlipPlayers {
                    frame: Frame::new(reader.u32().ok_or(short)?),
                }
            },
            Command::Mode => {
                expect(8)?;
                Message::Mode {
                    frame: Frame::new(reader.u32().ok_or(short)?),
                    tag: ModeTag::from_wire(reader.u32().ok_or(short)?),
                }
            },
            Command::Crc => {
                expect(8)?;
                Message::Crc {
                    frame: Frame::new(reader.u32().ok_or(short)?),
                    crc: reader.u32().ok_or(short)?,
                }
            },
            Command::LoadSavestate => {
                if raw.payload.len() < 8 {
                    return Err(short);
                }
                Message::LoadSavestate {
                    frame: Frame::new(reader.u32().ok_or(short)?),
                    inflated_len: reader.u32().ok_or(short)?,
                    zbytes: reader.rest(),
                }
            },
            Command::Hello => {
                expect(12)?;
                Message::Hello {
                    magic: reader.u32().ok_or(short)?,
                    version: reader.u32().ok_or(short)?,
                    flags: reader.u32().ok_or(short)?,
                }
            },
            Command::Nick => {
                expect(NICK_LEN)?;
                Message::Nick {
                    nick: reader.padded_str(NICK_LEN).ok_or(short)?,
                }
            },
            Command::Password => {
                expect(NICK_LEN)?;
                Message::Password {
                    password: reader.padded_str(NICK_LEN).ok_or(short)?,
                }
            },
            Command::Sync => {
                expect(24)?;
                Message::Sync {
                    frame: Frame::new(reader.u32().ok_or(short)?),
                    connected: SlotSet::from_bits(reader.u32().ok_or(short)? as u16),
                    flags: reader.u32().ok_or(short)?,
                    flip_frame: Frame::new(reader.u32().ok_or(short)?),
                    words_per_frame: reader.u32().ok_or(short)?,
                    state_size: reader.u32().ok_or(short)?,
                }
            },
        })
    }
}
