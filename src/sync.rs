//! The sync controller: rollback decisions, CRC checking, savestate
//! shipping.
//!
//! Runs at every frame boundary, after the local frame has been
//! simulated and emitted:
//!
//! 1. Recompute `unread` from the per-player read heads (and, on a
//!    client, the host-acknowledged horizon).
//! 2. Advance the rollback boundary `other` up to `unread`, validating
//!    any stashed remote CRC claims as frames become fully known.
//! 3. If a rewind was forced (misprediction, flip in the past, applied
//!    savestate), restore the snapshot at the boundary and replay
//!    forward, refreshing predictions under the resimulation rule.
//! 4. Grant deferred PLAY requests, broadcast the periodic CRC, and
//!    ship any requested savestates — all strictly after this frame's
//!    input emission, so none of it can overtake input on the wire.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::frame_ring::SlotCrc;
use crate::protocol::messages::{Message, ModeTag};
use crate::session::session::Role;
use crate::transport::PeerStream;
use crate::{
    checksum, input_multiplex, savestate, EmulatorCore, Frame, NetplayEvent, NetplaySession,
    PeerMode, PlayerSlot,
};

impl<S: PeerStream> NetplaySession<S> {
    /// Steps 1–3: moves the rollback boundary as far as arrived input
    /// permits, rewinding first when a correction is pending.
    pub(crate) fn catch_up<C: EmulatorCore>(&mut self, core: &mut C) {
        self.recompute_unread();
        if self.force_rewind {
            self.perform_rewind(core);
        }
        self.advance_other();
    }

    fn recompute_unread(&mut self) {
        let mut unread = self.self_frame().next();
        for p in self.connected.iter() {
            if let Some(read) = self.ring.read(p) {
                unread = unread.min(read.frame);
            }
        }
        if self.role == Role::Client && self.synced {
            unread = unread.min(self.ring.server().frame);
        }
        let unread = unread.max(self.other_frame());
        let cursor = self.ring.cursor_for(unread);
        self.ring.set_unread(cursor);
    }

    /// Promotes fully-known frames past the rollback boundary,
    /// comparing any remote CRC claims stashed on them.
    fn advance_other(&mut self) {
        let target = self.ring.unread().frame.min(self.self_frame());
        if target <= self.other_frame() {
            return;
        }
        let mut mismatches = Vec::new();
        let mut f = self.other_frame();
        while f < target {
            if let Some(slot) = self.ring.slot(f) {
                if let Some(SlotCrc::Remote(claimed)) = slot.crc {
                    if let Some(local) = checksum::slot_crc(slot) {
                        if local != claimed {
                            mismatches.push((f, local, claimed));
                        }
                    }
                }
            }
            f = f.next();
        }
        let cursor = self.ring.cursor_for(target);
        self.ring.set_other(cursor);
        trace!(other = %target, "rollback boundary advanced");
        for (frame, local, claimed) in mismatches {
            self.boundary_desync(frame, local, claimed);
        }
    }

    /// A stashed CRC claim failed once its frame became fully known.
    /// The claimant is no longer identifiable, so a host resyncs every
    /// playing peer; a client asks the host for a state.
    fn boundary_desync(&mut self, frame: Frame, local: u32, claimed: u32) {
        warn!(frame = %frame, local, claimed, "deferred checksum mismatch");
        self.push_event(NetplayEvent::DesyncSuspected { frame });
        match self.role {
            Role::Client => {
                if self.savestates_enabled() && !self.savestate_requested {
                    self.savestate_requested = true;
                    if let Some(conn) = self.connections.first_mut() {
                        conn.queue(&Message::RequestSavestate);
                    }
                }
            },
            Role::Host => {
                for conn in &mut self.connections {
                    if conn.is_active() && conn.mode.slot().is_some() {
                        conn.wants_savestate = true;
                    }
                }
            },
        }
    }

    /// Restores the snapshot at the rollback boundary and replays
    /// forward to where the head was. With savestates disabled the
    /// session cannot roll back; the flag is simply consumed.
    pub(crate) fn perform_rewind<C: EmulatorCore>(&mut self, core: &mut C) {
        self.force_rewind = false;
        if !self.savestates_enabled() {
            return;
        }
        let target = self.ring.other();
        let resume = self.ring.self_head().frame;

        let restored = {
            let Some(slot) = self.ring.slot(target.frame) else {
                warn!(frame = %target.frame, "rewind target slot missing, cannot roll back");
                return;
            };
            if !slot.has_state() {
                warn!(frame = %target.frame, "no snapshot at rewind target, cannot roll back");
                return;
            }
            let guard = self.autosave.lock();
            let ok = savestate::restore(core, &slot.state);
            drop(guard);
            ok
        };
        if !restored {
            warn!(frame = %target.frame, "core refused to restore, cannot roll back");
            return;
        }

        if target.frame >= resume {
            // A boundary at or past the head (an applied savestate):
            // adopt it outright, the next advance runs its frame.
            self.ring.set_self_head(target);
            debug!(frame = %target.frame, "adopted snapshot");
            return;
        }

        debug!(from = %resume, to = %target.frame, "rewinding");
        if self.ring.rewind_to(target.frame).is_err() {
            return;
        }
        while self.ring.self_head().frame < resume {
            let f = self.ring.self_head().frame;
            self.ring.set_replay(self.ring.cursor_for(f));
            input_multiplex::simulate_missing(
                &mut self.ring,
                f,
                self.connected,
                true,
                self.directional_mask,
            );
            self.capture_state(core, f);
            self.run_core(core, f);
            self.ring.advance_self();
        }
    }

    /// Step 4: everything that must follow this frame's input emission.
    pub(crate) fn flush_boundary_traffic<C: EmulatorCore>(&mut self, core: &mut C) {
        if self.role == Role::Host {
            self.grant_pending_play();
        }
        self.broadcast_periodic_crc();
        if self.role == Role::Host {
            self.send_pending_savestates(core);
        }
        self.pump_all();
    }

    /// Grants PLAY requests deferred from the command handler. Done
    /// here so the assignment frame sits exactly one past the input
    /// the peer has already been sent.
    fn grant_pending_play(&mut self) {
        for idx in 0..self.connections.len() {
            let conn = &self.connections[idx];
            if !conn.wants_play || !conn.is_active() || !conn.phase.is_established() {
                continue;
            }
            self.connections[idx].wants_play = false;
            if self.connections[idx].mode.slot().is_some() {
                continue;
            }
            let own = self.self_mode.slot().unwrap_or(PlayerSlot::HOST);
            let Some(slot) = self.connected.lowest_free(own) else {
                self.nak_hangup(
                    idx,
                    crate::error::ProtocolErrorKind::IllegalModeChange {
                        frame: self.self_frame(),
                    },
                );
                continue;
            };
            let frame = self.self_frame();
            self.connected.insert(slot);
            self.connections[idx].mode = PeerMode::Playing(slot);
            self.ring.set_read(slot, Some(self.ring.cursor_for(frame)));
            let nick = self.connections[idx].display_nick();
            debug!(slot = %slot, nick = %nick, frame = %frame, "player slot granted");
            self.broadcast_except(
                &Message::Mode {
                    frame,
                    tag: ModeTag {
                        slot,
                        you: false,
                        playing: true,
                    },
                },
                idx,
            );
            self.connections[idx].queue(&Message::Mode {
                frame,
                tag: ModeTag {
                    slot,
                    you: true,
                    playing: true,
                },
            });
            self.push_event(NetplayEvent::PeerJoined { slot, nick });
        }
    }

    /// Broadcasts the CRC of the newest completed check-interval frame
    /// still in the ring.
    fn broadcast_periodic_crc(&mut self) {
        if !self.savestates_enabled() {
            return;
        }
        let other = self.other_frame();
        let f = Frame::new((other.as_u32() / self.check_frames) * self.check_frames);
        if self.last_crc_frame.is_some_and(|last| last >= f) {
            return;
        }
        let crc = {
            let Some(slot) = self.ring.slot_mut(f) else {
                return;
            };
            let Some(crc) = checksum::slot_crc(slot) else {
                return;
            };
            if slot.crc.is_none() {
                slot.crc = Some(SlotCrc::Local(crc));
            }
            crc
        };
        self.last_crc_frame = Some(f);
        trace!(frame = %f, crc, "broadcasting checksum");
        self.broadcast(&Message::Crc { frame: f, crc });
    }

    /// Ships the current snapshot to every peer that asked for one.
    /// Runs strictly after this frame's input emission so the state
    /// never overtakes input on the wire.
    fn send_pending_savestates(&mut self, core: &mut impl EmulatorCore) {
        if !self.connections.iter().any(|c| c.wants_savestate) {
            return;
        }
        if !self.savestates_enabled()
            || self.quirks.contains(crate::Quirks::NO_TRANSMISSION)
            || self.self_mode.slot().is_none()
        {
            for conn in &mut self.connections {
                conn.wants_savestate = false;
            }
            return;
        }
        let mut raw = Vec::new();
        let captured = {
            let guard = self.autosave.lock();
            let ok = savestate::capture(core, &mut raw, self.state_size);
            drop(guard);
            ok
        };
        if !captured {
            warn!("core refused to serialize for resync");
            return;
        }
        let zbytes = Bytes::from(self.compressor.compress(&raw));
        let frame = self.self_frame();
        let msg = Message::LoadSavestate {
            frame,
            inflated_len: self.state_size as u32,
            zbytes,
        };
        let mut snapped = Vec::new();
        for conn in &mut self.connections {
            if conn.wants_savestate && conn.is_active() && conn.phase.is_established() {
                debug!(frame = %frame, nick = %conn.display_nick(), "shipping savestate");
                conn.queue(&msg);
                // The receiver adopts this frame and resumes emitting
                // input from it; the frames it skips are authoritative
                // as we predicted them.
                if let Some(p) = conn.mode.slot() {
                    snapped.push(p);
                }
            }
            conn.wants_savestate = false;
        }
        for p in snapped {
            if self.ring.read(p).is_some_and(|c| c.frame < frame) {
                self.ring.set_read(p, Some(self.ring.cursor_for(frame)));
            }
        }
    }
}
