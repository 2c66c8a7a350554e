//! Merges local, predicted, and received remote inputs per frame.
//!
//! Every live frame between the rollback boundary and the local head
//! must present one input sample per connected player before the core
//! can run it. Resolution is simple: authoritative input wins, the
//! prediction stands in until it arrives.
//!
//! Prediction comes in two flavours:
//!
//! - **First-time simulation** repeats the most recent authoritative
//!   sample from that player wholesale. Players hold their inputs far
//!   more often than they change them, so this is right most frames.
//! - **Resimulation** (replaying after real input landed mid-window)
//!   copies only the directional bits from the fresh sample and keeps
//!   the previously predicted button bits. Directional holds compound
//!   correctly across rollback wavefronts that way, while edge-triggered
//!   buttons would otherwise appear to retrigger on every replay.
//!
//! The directional mask is session-configured and applies to word 0 of
//! the sample; see [`crate::DEFAULT_DIRECTIONAL_MASK`].

use smallvec::smallvec;

use crate::frame_ring::{FrameRing, FrameSlot};
use crate::{Frame, InputWords, PlayerSlot, SlotSet};

/// A fully resolved input set for one frame, as passed to
/// [`EmulatorCore::run`](crate::EmulatorCore::run).
///
/// Disconnected slots resolve to `None`; the core decides what an
/// absent controller means.
pub struct ResolvedInputs<'a> {
    frame: Frame,
    connected: SlotSet,
    slot: Option<&'a FrameSlot>,
}

impl<'a> ResolvedInputs<'a> {
    pub(crate) fn new(frame: Frame, connected: SlotSet, slot: &'a FrameSlot) -> Self {
        ResolvedInputs {
            frame,
            connected,
            slot: Some(slot),
        }
    }

    /// An input set with no players at all, used when the core must be
    /// run outside the session's frame accounting (serialization
    /// warm-up).
    #[must_use]
    pub fn idle(frame: Frame) -> ResolvedInputs<'static> {
        ResolvedInputs {
            frame,
            connected: SlotSet::EMPTY,
            slot: None,
        }
    }

    /// The frame these inputs belong to.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// The set of connected player slots.
    #[must_use]
    pub fn connected(&self) -> SlotSet {
        self.connected
    }

    /// The input words for `player`, or `None` if that slot is not
    /// connected.
    #[must_use]
    pub fn player(&self, player: PlayerSlot) -> Option<&[u32]> {
        let slot = self.slot?;
        self.connected
            .contains(player)
            .then(|| slot.resolved_input(player).as_slice())
    }

    /// Whether `player`'s sample is authoritative rather than
    /// predicted.
    #[must_use]
    pub fn is_confirmed(&self, player: PlayerSlot) -> bool {
        self.slot
            .is_some_and(|slot| slot.have_real.contains(player))
    }
}

/// The most recent authoritative sample known for `player`: the one in
/// the slot just before the player's read head. Zeros when no sample
/// has ever arrived (session start).
#[must_use]
pub fn latest_real(ring: &FrameRing, player: PlayerSlot) -> InputWords {
    let words = ring.words_per_frame();
    let fallback = || smallvec![0; words];
    let Some(read) = ring.read(player) else {
        return fallback();
    };
    let Some(prev_frame) = read.frame.prev() else {
        return fallback();
    };
    match ring.slot(prev_frame) {
        Some(slot) if slot.have_real.contains(player) => slot.real_input[player.as_usize()].clone(),
        _ => fallback(),
    }
}

/// Writes a prediction for `player` into the slot for `frame`.
///
/// `resim` selects the resimulation rule: directional bits are taken
/// from the newest authoritative sample, everything else keeps the
/// previous prediction. A first-time simulation copies the newest
/// authoritative sample wholesale.
pub fn simulate(
    ring: &mut FrameRing,
    frame: Frame,
    player: PlayerSlot,
    resim: bool,
    directional_mask: u32,
) {
    let source = latest_real(ring, player);
    let Some(slot) = ring.slot_mut(frame) else {
        return;
    };
    let sim = &mut slot.simulated_input[player.as_usize()];
    if resim {
        if let (Some(sim0), Some(src0)) = (sim.first().copied(), source.first().copied()) {
            sim[0] = (sim0 & !directional_mask) | (src0 & directional_mask);
        }
    } else {
        sim.clear();
        sim.extend_from_slice(&source);
    }
}

/// Predicts every connected player that is still missing authoritative
/// input on `frame`.
pub fn simulate_missing(
    ring: &mut FrameRing,
    frame: Frame,
    connected: SlotSet,
    resim: bool,
    directional_mask: u32,
) {
    for player in connected.iter() {
        let needs = ring
            .slot(frame)
            .is_some_and(|slot| !slot.have_real.contains(player));
        if needs {
            simulate(ring, frame, player, resim, directional_mask);
        }
    }
}
