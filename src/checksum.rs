//! Frame checksums for desync detection.
//!
//! Peers periodically exchange a CRC-32 of a completed frame's
//! serialized state. Because every participant runs the same
//! deterministic core over the same input sequence, the checksums must
//! agree; a mismatch means the simulations have diverged and a
//! savestate resync is required.
//!
//! CRC-32 is plenty here: the comparison guards against divergence, not
//! malice, and a false negative merely delays recovery by one check
//! interval.

use crc32fast::Hasher;

use crate::frame_ring::FrameSlot;

/// CRC-32 of an arbitrary byte buffer.
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// The checksum of a frame slot's serialized state, or `None` when no
/// snapshot was captured for that frame (savestates disabled or not yet
/// taken). Frames without state cannot be checked.
#[must_use]
pub fn slot_crc(slot: &FrameSlot) -> Option<u32> {
    slot.has_state().then(|| crc32(&slot.state))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::frame_ring::FrameRing;
    use crate::{Frame, SlotSet};

    #[test]
    fn crc_is_stable() {
        assert_eq!(crc32(b"rollnet"), crc32(b"rollnet"));
        assert_ne!(crc32(b"rollnet"), crc32(b"rollnet!"));
    }

    #[test]
    fn crc_of_empty_input() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn slot_without_state_has_no_crc() {
        let mut ring = FrameRing::new(2, 3).unwrap();
        ring.prepare(Frame::ZERO, SlotSet::EMPTY);
        assert_eq!(slot_crc(ring.slot(Frame::ZERO).unwrap()), None);
    }

    #[test]
    fn slot_with_state_hashes_it() {
        let mut ring = FrameRing::new(2, 3).unwrap();
        ring.prepare(Frame::ZERO, SlotSet::EMPTY);
        ring.slot_mut(Frame::ZERO).unwrap().state = b"snapshot".to_vec();
        assert_eq!(
            slot_crc(ring.slot(Frame::ZERO).unwrap()),
            Some(crc32(b"snapshot"))
        );
    }
}
