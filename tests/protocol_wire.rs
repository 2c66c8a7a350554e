//! Wire-level properties: framing round-trips, short reads, and
//! hostile input never panicking the parser.

use bytes::BytesMut;
use proptest::prelude::*;
use smallvec::smallvec;

use rollnet::protocol::codec::{encode_frame, try_decode_frame};
use rollnet::protocol::messages::{InputTag, Message, ModeTag};
use rollnet::{Frame, PlayerSlot, SlotSet};

const WORDS: usize = 3;

fn roundtrip(msg: &Message) -> Message {
    let mut buf = BytesMut::new();
    msg.encode(&mut buf);
    let raw = try_decode_frame(&mut buf, 1 << 20)
        .expect("well-formed frame")
        .expect("complete frame");
    Message::parse(raw, WORDS).expect("well-formed message")
}

proptest! {
    /// Any (cmd, payload) pair survives framing unchanged.
    #[test]
    fn frame_roundtrip(cmd in any::<u32>(), payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let mut buf = BytesMut::new();
        encode_frame(cmd, &payload, &mut buf);
        let raw = try_decode_frame(&mut buf, 512).unwrap().unwrap();
        prop_assert_eq!(raw.cmd, cmd);
        prop_assert_eq!(&raw.payload[..], &payload[..]);
        prop_assert!(buf.is_empty());
    }

    /// Truncating a frame anywhere gives a short read, never a tear.
    #[test]
    fn truncated_frames_are_short_reads(
        cmd in any::<u32>(),
        payload in proptest::collection::vec(any::<u8>(), 0..64),
        cut in 0usize..71,
    ) {
        let mut full = BytesMut::new();
        encode_frame(cmd, &payload, &mut full);
        let cut = cut.min(full.len().saturating_sub(1));
        let mut partial = BytesMut::from(&full[..cut]);
        let before = partial.len();
        let result = try_decode_frame(&mut partial, 64);
        prop_assert!(matches!(result, Ok(None)));
        prop_assert_eq!(partial.len(), before, "short read must not consume");
    }

    /// Arbitrary bytes never panic the decoder or the message parser.
    #[test]
    fn garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut buf = BytesMut::from(&bytes[..]);
        if let Ok(Some(raw)) = try_decode_frame(&mut buf, 128) {
            let _ = Message::parse(raw, WORDS);
        }
    }

    /// Input frames round-trip for every frame number, slot, and word
    /// pattern.
    #[test]
    fn input_message_roundtrip(
        frame in any::<u32>(),
        slot in 0u8..16,
        from_host in any::<bool>(),
        w0 in any::<u32>(), w1 in any::<u32>(), w2 in any::<u32>(),
    ) {
        let msg = Message::Input {
            frame: Frame::new(frame),
            tag: InputTag { slot: PlayerSlot::new(slot), from_host },
            words: smallvec![w0, w1, w2],
        };
        prop_assert_eq!(roundtrip(&msg), msg);
    }

    /// Mode tags round-trip for every slot and bit combination.
    #[test]
    fn mode_message_roundtrip(
        frame in any::<u32>(),
        slot in 0u8..16,
        you in any::<bool>(),
        playing in any::<bool>(),
    ) {
        let msg = Message::Mode {
            frame: Frame::new(frame),
            tag: ModeTag { slot: PlayerSlot::new(slot), you, playing },
        };
        prop_assert_eq!(roundtrip(&msg), msg);
    }
}

#[test]
fn sync_snapshot_roundtrip() {
    let mut connected = SlotSet::EMPTY;
    connected.insert(PlayerSlot::new(0));
    connected.insert(PlayerSlot::new(3));
    let msg = Message::Sync {
        frame: Frame::new(12345),
        connected,
        flags: 0,
        flip_frame: Frame::ZERO,
        words_per_frame: WORDS as u32,
        state_size: 65536,
    };
    assert_eq!(roundtrip(&msg), msg);
}

#[test]
fn interleaved_commands_parse_in_order() {
    let mut wire = BytesMut::new();
    Message::Pause.encode(&mut wire);
    Message::Crc {
        frame: Frame::new(50),
        crc: 0x1234_5678,
    }
    .encode(&mut wire);
    Message::Resume.encode(&mut wire);

    let mut seen = Vec::new();
    while let Some(raw) = try_decode_frame(&mut wire, 64).unwrap() {
        seen.push(Message::parse(raw, WORDS).unwrap());
    }
    assert_eq!(
        seen,
        vec![
            Message::Pause,
            Message::Crc {
                frame: Frame::new(50),
                crc: 0x1234_5678
            },
            Message::Resume,
        ]
    );
}
