//! Fixed-size circular buffer of per-frame slots.
//!
//! The ring is the session's working memory: every frame between the
//! rollback boundary and the local simulation head lives in exactly one
//! slot. With a session delay budget of `DF` frames the ring has
//! `2·DF + 1` slots, enough to hold the local head up to `DF` frames
//! ahead of the boundary and remote read heads up to `DF` frames ahead
//! of the local head at the same time. Frame numbers map to slots by
//! plain modulo; frame counters are independent of ring indices.
//!
//! Cursors pair a slot index with the logical frame it points at and
//! only ever move together:
//!
//! - `self_head` — the frame being (or about to be) simulated locally
//! - `other` — oldest frame whose inputs are fully known; the rollback
//!   boundary. Never ahead of `self_head`.
//! - `unread` — earliest frame some connected peer has not delivered
//! - `server` — (client only) oldest frame the host has acknowledged
//! - `read[p]` — next frame expected from player slot `p`
//! - `replay` — scratch cursor while re-running frames

use smallvec::smallvec;
use tracing::trace;

use crate::error::NetplayError;
use crate::{Frame, InputWords, PlayerSlot, SlotSet, MAX_PLAYERS};

/// A slot index paired with the logical frame occupying it. The two
/// fields move atomically; a cursor is never half-updated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// Index into the ring's slot array.
    pub ptr: usize,
    /// The logical frame this cursor points at.
    pub frame: Frame,
}

/// A checksum attached to a slot: either computed locally when the
/// frame's CRC was broadcast, or claimed by a remote peer and stashed
/// for comparison once the frame is fully known.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotCrc {
    /// Computed by us.
    Local(u32),
    /// Claimed by a peer; compared when `other` catches up.
    Remote(u32),
}

/// One logical frame's worth of inputs and, optionally, serialized
/// state.
#[derive(Debug)]
pub struct FrameSlot {
    /// Whether the slot holds meaningful data for its frame.
    pub used: bool,
    /// The logical frame occupying the slot, valid once prepared.
    pub frame: Frame,
    /// The local participant's input sample for this frame.
    pub self_state: InputWords,
    /// Authoritative input per player slot.
    pub real_input: Vec<InputWords>,
    /// Predicted input per player slot.
    pub simulated_input: Vec<InputWords>,
    /// Local input has been sampled for this frame.
    pub have_local: bool,
    /// Which players' authoritative input has arrived.
    pub have_real: SlotSet,
    /// Serialized simulation snapshot. The allocation is reused across
    /// prepares; emptiness means no snapshot was taken for this frame.
    pub state: Vec<u8>,
    /// Checksum attached to this frame, if any.
    pub crc: Option<SlotCrc>,

    prepared: bool,
}

impl FrameSlot {
    fn new(words: usize) -> Self {
        FrameSlot {
            used: false,
            frame: Frame::ZERO,
            self_state: smallvec![0; words],
            real_input: (0..MAX_PLAYERS).map(|_| smallvec![0; words]).collect(),
            simulated_input: (0..MAX_PLAYERS).map(|_| smallvec![0; words]).collect(),
            have_local: false,
            have_real: SlotSet::EMPTY,
            state: Vec::new(),
            crc: None,
            prepared: false,
        }
    }

    /// The input sample that should be used for `player` on this frame:
    /// the authoritative one when it has arrived, the prediction
    /// otherwise.
    #[must_use]
    pub fn resolved_input(&self, player: PlayerSlot) -> &InputWords {
        if self.have_real.contains(player) {
            &self.real_input[player.as_usize()]
        } else {
            &self.simulated_input[player.as_usize()]
        }
    }

    /// Whether a snapshot has been captured into this slot.
    #[must_use]
    pub fn has_state(&self) -> bool {
        !self.state.is_empty()
    }
}

/// The circular frame buffer and every cursor that walks it.
#[derive(Debug)]
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    delay_frames: u32,
    words: usize,

    self_head: Cursor,
    other: Cursor,
    unread: Cursor,
    server: Cursor,
    replay: Cursor,
    read: Vec<Option<Cursor>>,
}

impl FrameRing {
    /// Creates a ring sized `2·delay_frames + 1` with every cursor at
    /// frame 0.
    ///
    /// # Errors
    /// `delay_frames` of zero would size the ring at one slot, leaving
    /// no room to speculate; it is rejected as fatal.
    pub fn new(delay_frames: u32, words: usize) -> Result<Self, NetplayError> {
        if delay_frames == 0 {
            return Err(NetplayError::Fatal {
                context: "frame ring requires a delay budget of at least one frame",
            });
        }
        let size = 2 * delay_frames as usize + 1;
        let origin = Cursor {
            ptr: 0,
            frame: Frame::ZERO,
        };
        Ok(FrameRing {
            slots: (0..size).map(|_| FrameSlot::new(words)).collect(),
            delay_frames,
            words,
            self_head: origin,
            other: origin,
            unread: origin,
            server: origin,
            replay: origin,
            read: vec![None; MAX_PLAYERS],
        })
    }

    /// The number of slots, always `2·DF + 1`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// The session delay budget `DF`.
    #[must_use]
    pub fn delay_frames(&self) -> u32 {
        self.delay_frames
    }

    /// Words per input sample in this session.
    #[must_use]
    pub fn words_per_frame(&self) -> usize {
        self.words
    }

    /// The cursor addressing `frame`.
    #[must_use]
    pub fn cursor_for(&self, frame: Frame) -> Cursor {
        Cursor {
            ptr: frame.as_u32() as usize % self.slots.len(),
            frame,
        }
    }

    /// The local simulation head.
    #[must_use]
    pub fn self_head(&self) -> Cursor {
        self.self_head
    }

    /// The rollback boundary: the oldest frame whose inputs are fully
    /// known and which will therefore never be re-run.
    #[must_use]
    pub fn other(&self) -> Cursor {
        self.other
    }

    /// The earliest frame some connected peer has not yet delivered.
    #[must_use]
    pub fn unread(&self) -> Cursor {
        self.unread
    }

    /// The host-acknowledged horizon (meaningful on clients only).
    #[must_use]
    pub fn server(&self) -> Cursor {
        self.server
    }

    /// The scratch cursor used while re-running frames.
    #[must_use]
    pub fn replay(&self) -> Cursor {
        self.replay
    }

    /// The next frame expected from player `p`, if `p` is being read.
    #[must_use]
    pub fn read(&self, p: PlayerSlot) -> Option<Cursor> {
        self.read[p.as_usize()]
    }

    pub(crate) fn set_unread(&mut self, cursor: Cursor) {
        self.unread = cursor;
    }

    pub(crate) fn set_other(&mut self, cursor: Cursor) {
        self.other = cursor;
    }

    pub(crate) fn set_server(&mut self, cursor: Cursor) {
        self.server = cursor;
    }

    pub(crate) fn set_replay(&mut self, cursor: Cursor) {
        self.replay = cursor;
    }

    pub(crate) fn set_read(&mut self, p: PlayerSlot, cursor: Option<Cursor>) {
        self.read[p.as_usize()] = cursor;
    }

    pub(crate) fn set_self_head(&mut self, cursor: Cursor) {
        self.self_head = cursor;
    }

    /// Advances the read head for player `p` by one frame. Does nothing
    /// if `p` is not being read.
    pub(crate) fn advance_read(&mut self, p: PlayerSlot) {
        if let Some(cur) = self.read[p.as_usize()] {
            self.read[p.as_usize()] = Some(self.cursor_for(cur.frame.next()));
        }
    }

    /// The slot currently assigned to `frame`, if it has been prepared
    /// for that frame.
    #[must_use]
    pub fn slot(&self, frame: Frame) -> Option<&FrameSlot> {
        let slot = &self.slots[frame.as_u32() as usize % self.slots.len()];
        (slot.prepared && slot.frame == frame).then_some(slot)
    }

    /// Mutable access to the slot assigned to `frame`.
    pub fn slot_mut(&mut self, frame: Frame) -> Option<&mut FrameSlot> {
        let idx = frame.as_u32() as usize % self.slots.len();
        let slot = &mut self.slots[idx];
        (slot.prepared && slot.frame == frame).then_some(slot)
    }

    /// Whether the slot for `frame` is prepared to take data for it.
    #[must_use]
    pub fn ready(&self, frame: Frame) -> bool {
        self.slot(frame).is_some()
    }

    /// Zeroes or refreshes a slot so it may take frame `frame`.
    ///
    /// Idempotent per frame: preparing an already-prepared slot is a
    /// no-op, so input that arrived before the local simulation reached
    /// the frame is never wiped. Clears the local flag, every
    /// authoritative flag and, for players in `connected`, the
    /// prediction words. The snapshot buffer is kept so savestate
    /// storage is reused.
    pub fn prepare(&mut self, frame: Frame, connected: SlotSet) {
        let idx = frame.as_u32() as usize % self.slots.len();
        let slot = &mut self.slots[idx];
        if slot.prepared && slot.frame == frame {
            return;
        }
        trace!(frame = %frame, slot = idx, "prepare ring slot");
        slot.prepared = true;
        slot.used = false;
        slot.frame = frame;
        slot.have_local = false;
        slot.have_real = SlotSet::EMPTY;
        slot.crc = None;
        slot.self_state.iter_mut().for_each(|w| *w = 0);
        for p in connected.iter() {
            slot.simulated_input[p.as_usize()]
                .iter_mut()
                .for_each(|w| *w = 0);
        }
    }

    /// Marks the slot for `frame` as holding meaningful data.
    ///
    /// # Errors
    /// The slot must have been prepared for `frame` first.
    pub fn mark_used(&mut self, frame: Frame) -> Result<(), NetplayError> {
        match self.slot_mut(frame) {
            Some(slot) => {
                slot.used = true;
                Ok(())
            },
            None => Err(NetplayError::Fatal {
                context: "marking a frame used before preparing its slot",
            }),
        }
    }

    /// Moves the local head forward one frame.
    pub fn advance_self(&mut self) {
        let next = self.self_head.frame.next();
        self.self_head = self.cursor_for(next);
    }

    /// Repositions the local head onto `frame` for a replay forward.
    ///
    /// # Errors
    /// `frame` must not be behind the rollback boundary: those slots
    /// have been surrendered to reuse.
    pub fn rewind_to(&mut self, frame: Frame) -> Result<(), NetplayError> {
        if frame < self.other.frame {
            return Err(NetplayError::Fatal {
                context: "rewind target is behind the rollback boundary",
            });
        }
        trace!(target = %frame, from = %self.self_head.frame, "rewind");
        self.self_head = self.cursor_for(frame);
        Ok(())
    }

    /// How far the local head may still advance before the ring would
    /// overwrite the rollback boundary.
    #[must_use]
    pub fn speculation_left(&self) -> u32 {
        self.delay_frames
            .saturating_sub(self.self_head.frame.since(self.other.frame))
    }

    /// Debug check of the cursor invariants. Call after every public
    /// mutation in tests; compiled out of release builds.
    pub fn check_invariants(&self, connected: SlotSet) {
        debug_assert!(
            self.other.frame <= self.unread.frame,
            "other {} must not pass unread {}",
            self.other.frame,
            self.unread.frame
        );
        debug_assert!(
            self.unread.frame <= self.self_head.frame.next(),
            "unread {} must not pass self {} + 1",
            self.unread.frame,
            self.self_head.frame
        );
        debug_assert!(
            self.self_head.frame.since(self.other.frame) <= self.delay_frames,
            "self {} ran more than DF ahead of other {}",
            self.self_head.frame,
            self.other.frame
        );
        for p in connected.iter() {
            if let Some(read) = self.read[p.as_usize()] {
                debug_assert!(
                    read.frame >= self.other.frame,
                    "read[{p}] {} fell behind other {}",
                    read.frame,
                    self.other.frame
                );
                debug_assert!(
                    read.frame.since(self.self_head.frame) <= self.delay_frames,
                    "read[{p}] {} ran more than DF ahead of self {}",
                    read.frame,
                    self.self_head.frame
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ring(df: u32) -> FrameRing {
        FrameRing::new(df, 3).unwrap()
    }

    #[test]
    fn ring_size_is_twice_delay_plus_one() {
        assert_eq!(ring(4).size(), 9);
        assert_eq!(ring(1).size(), 3);
    }

    #[test]
    fn zero_delay_is_fatal() {
        assert!(matches!(
            FrameRing::new(0, 3),
            Err(NetplayError::Fatal { .. })
        ));
    }

    #[test]
    fn prepare_makes_slot_ready() {
        let mut ring = ring(2);
        assert!(!ring.ready(Frame::new(7)));
        ring.prepare(Frame::new(7), SlotSet::EMPTY);
        assert!(ring.ready(Frame::new(7)));
        assert!(!ring.slot(Frame::new(7)).unwrap().used);
    }

    #[test]
    fn prepare_is_idempotent() {
        let mut ring = ring(2);
        let mut connected = SlotSet::EMPTY;
        connected.insert(PlayerSlot::new(1));

        ring.prepare(Frame::new(3), connected);
        {
            let slot = ring.slot_mut(Frame::new(3)).unwrap();
            slot.have_local = true;
            slot.real_input[1][0] = 0xAA;
            slot.have_real.insert(PlayerSlot::new(1));
        }
        // A second prepare for the same frame must not wipe anything.
        ring.prepare(Frame::new(3), connected);
        let slot = ring.slot(Frame::new(3)).unwrap();
        assert!(slot.have_local);
        assert!(slot.have_real.contains(PlayerSlot::new(1)));
        assert_eq!(slot.real_input[1][0], 0xAA);
    }

    #[test]
    fn prepare_clears_predictions_of_connected_players_only() {
        let mut ring = ring(2);
        let mut connected = SlotSet::EMPTY;
        connected.insert(PlayerSlot::new(1));

        ring.prepare(Frame::new(0), SlotSet::EMPTY);
        {
            let slot = ring.slot_mut(Frame::new(0)).unwrap();
            slot.simulated_input[1][0] = 0x11;
            slot.simulated_input[2][0] = 0x22;
        }
        // Reoccupy the same physical slot with a later frame.
        let same_slot_frame = Frame::new(ring.size() as u32);
        ring.prepare(same_slot_frame, connected);
        let slot = ring.slot(same_slot_frame).unwrap();
        assert_eq!(slot.simulated_input[1][0], 0, "connected player cleared");
        assert_eq!(slot.simulated_input[2][0], 0x22, "disconnected player kept");
    }

    #[test]
    fn prepare_preserves_state_buffer() {
        let mut ring = ring(2);
        ring.prepare(Frame::new(0), SlotSet::EMPTY);
        ring.slot_mut(Frame::new(0)).unwrap().state = vec![1, 2, 3];
        let same_slot_frame = Frame::new(ring.size() as u32);
        ring.prepare(same_slot_frame, SlotSet::EMPTY);
        assert_eq!(ring.slot(same_slot_frame).unwrap().state, vec![1, 2, 3]);
    }

    #[test]
    fn mark_used_requires_prepare() {
        let mut ring = ring(2);
        assert!(ring.mark_used(Frame::new(5)).is_err());
        ring.prepare(Frame::new(5), SlotSet::EMPTY);
        ring.mark_used(Frame::new(5)).unwrap();
        assert!(ring.slot(Frame::new(5)).unwrap().used);
    }

    #[test]
    fn advance_self_moves_both_halves() {
        let mut ring = ring(2);
        ring.advance_self();
        assert_eq!(ring.self_head().frame, Frame::new(1));
        assert_eq!(ring.self_head().ptr, 1);
        // Wrap around the 5-slot ring.
        for _ in 0..4 {
            ring.advance_self();
        }
        assert_eq!(ring.self_head().frame, Frame::new(5));
        assert_eq!(ring.self_head().ptr, 0);
    }

    #[test]
    fn rewind_refuses_to_cross_other() {
        let mut ring = ring(4);
        for _ in 0..3 {
            ring.advance_self();
        }
        ring.set_other(ring.cursor_for(Frame::new(2)));
        assert!(ring.rewind_to(Frame::new(1)).is_err());
        ring.rewind_to(Frame::new(2)).unwrap();
        assert_eq!(ring.self_head().frame, Frame::new(2));
    }

    #[test]
    fn resolved_input_prefers_real() {
        let mut ring = ring(2);
        let p = PlayerSlot::new(1);
        ring.prepare(Frame::ZERO, SlotSet::EMPTY);
        {
            let slot = ring.slot_mut(Frame::ZERO).unwrap();
            slot.simulated_input[1][0] = 0xBEEF;
            slot.real_input[1][0] = 0xCAFE;
        }
        assert_eq!(ring.slot(Frame::ZERO).unwrap().resolved_input(p)[0], 0xBEEF);
        ring.slot_mut(Frame::ZERO).unwrap().have_real.insert(p);
        assert_eq!(ring.slot(Frame::ZERO).unwrap().resolved_input(p)[0], 0xCAFE);
    }

    #[test]
    fn speculation_budget_shrinks_as_self_runs_ahead() {
        let mut ring = ring(4);
        assert_eq!(ring.speculation_left(), 4);
        ring.advance_self();
        ring.advance_self();
        assert_eq!(ring.speculation_left(), 2);
    }

    #[test]
    fn read_head_advances_per_player() {
        let mut ring = ring(4);
        let p = PlayerSlot::new(2);
        assert!(ring.read(p).is_none());
        ring.set_read(p, Some(ring.cursor_for(Frame::new(3))));
        ring.advance_read(p);
        let cur = ring.read(p).unwrap();
        assert_eq!(cur.frame, Frame::new(4));
        assert_eq!(cur.ptr, 4 % ring.size());
    }

    #[test]
    fn invariants_hold_after_normal_motion() {
        let mut ring = ring(4);
        let mut connected = SlotSet::EMPTY;
        connected.insert(PlayerSlot::new(1));
        ring.set_read(PlayerSlot::new(1), Some(ring.cursor_for(Frame::ZERO)));
        for f in 0..4u32 {
            ring.prepare(Frame::new(f), connected);
            ring.advance_self();
        }
        ring.check_invariants(connected);
    }
}
