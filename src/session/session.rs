//! The netplay session: role, cursors, frame boundary, public surface.
//!
//! The session is single-threaded and cooperative with the embedding
//! frontend's main loop. At each local frame boundary the frontend
//! calls [`NetplaySession::advance_frame`], which drains inbound
//! commands as far as buffered data permits, simulates the current
//! frame (predicting any input that has not arrived), emits the local
//! input sample, and then lets the sync controller promote fully-known
//! frames and rewind/replay where real input disagreed with a
//! prediction.
//!
//! Nothing here blocks except the explicit stall path: when the local
//! head has speculated its entire delay budget ahead of the rollback
//! boundary, the session waits in [`RETRY_MS`] windows for the missing
//! input, and after [`MAX_RETRIES`] unfruitful windows reports a stall
//! unless every peer is paused.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use web_time::{Duration, Instant};

use crate::connection::{Connection, HandshakePhase, PumpOutcome};
use crate::error::NetplayError;
use crate::frame_ring::FrameRing;
use crate::input_multiplex::{self, ResolvedInputs};
use crate::protocol::messages::{InputTag, Message};
use crate::savestate::{self, StateCompressor};
use crate::transport::{PeerStream, StreamListener, POLL_SLICE_MS};
use crate::{
    EmulatorCore, Frame, InputWords, NetplayEvent, PeerMode, PlayerSlot, Quirks, SlotSet,
    MAX_RETRIES, NICK_LEN, RETRY_MS,
};

/// Whether this session arbitrates the game or follows a host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Role {
    /// Authoritative: assigns slots, amplifies input, ships savestates.
    Host,
    /// Follows the host's arbitration.
    Client,
}

/// A rollback netplay session over some byte-stream transport.
///
/// Construct with [`SessionBuilder`](crate::SessionBuilder). Sessions
/// are deliberately not `Send`: everything happens on the frontend's
/// main loop thread.
pub struct NetplaySession<S: PeerStream> {
    pub(crate) role: Role,
    pub(crate) listener: Option<Box<dyn StreamListener<Stream = S>>>,
    pub(crate) connections: Vec<Connection<S>>,
    pub(crate) ring: FrameRing,

    // configuration
    pub(crate) check_frames: u32,
    pub(crate) directional_mask: u32,
    pub(crate) words: usize,
    pub(crate) password: Option<String>,
    pub(crate) nick: String,
    pub(crate) nat_traversal: bool,

    // membership
    pub(crate) self_mode: PeerMode,
    pub(crate) want_play: bool,
    pub(crate) connected: SlotSet,
    pub(crate) flip: bool,
    pub(crate) flip_frame: Frame,

    // core state
    pub(crate) quirks: Quirks,
    pub(crate) state_size: usize,
    pub(crate) force_rewind: bool,
    pub(crate) local_paused: bool,
    pub(crate) savestate_requested: bool,
    pub(crate) last_crc_frame: Option<Frame>,
    pub(crate) stall_retries: u32,
    pub(crate) synced: bool,

    pub(crate) events: VecDeque<NetplayEvent>,
    pub(crate) autosave: Arc<Mutex<()>>,
    pub(crate) compressor: Box<dyn StateCompressor>,
}

impl<S: PeerStream> std::fmt::Debug for NetplaySession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetplaySession")
            .field("role", &self.role)
            .field("synced", &self.synced)
            .finish_non_exhaustive()
    }
}

impl<S: PeerStream> NetplaySession<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: Role,
        listener: Option<Box<dyn StreamListener<Stream = S>>>,
        connections: Vec<Connection<S>>,
        ring: FrameRing,
        check_frames: u32,
        directional_mask: u32,
        password: Option<String>,
        nick: String,
        nat_traversal: bool,
        want_play: bool,
        quirks: Quirks,
        state_size: usize,
        autosave: Arc<Mutex<()>>,
        compressor: Box<dyn StateCompressor>,
    ) -> Self {
        let words = ring.words_per_frame();
        let mut session = NetplaySession {
            role,
            listener,
            connections,
            ring,
            check_frames,
            directional_mask,
            words,
            password,
            nick,
            nat_traversal,
            self_mode: PeerMode::None,
            want_play,
            connected: SlotSet::EMPTY,
            flip: false,
            flip_frame: Frame::ZERO,
            quirks,
            state_size,
            force_rewind: false,
            local_paused: false,
            savestate_requested: false,
            last_crc_frame: None,
            stall_retries: 0,
            synced: false,
            events: VecDeque::new(),
            autosave,
            compressor,
        };
        if session.role == Role::Host {
            // The host arbitrates from frame 0 and, when it wants to
            // play, owns slot 0 from the start.
            session.synced = true;
            if want_play {
                session.become_local_player(PlayerSlot::HOST);
            } else {
                session.self_mode = PeerMode::Spectating;
            }
        }
        session
    }

    pub(crate) fn become_local_player(&mut self, slot: PlayerSlot) {
        self.self_mode = PeerMode::Playing(slot);
        self.connected.insert(slot);
        self.ring
            .set_read(slot, Some(self.ring.cursor_for(self.ring.self_head().frame)));
    }

    // #############
    // # ACCESSORS #
    // #############

    /// The frame the local simulation is about to produce.
    #[must_use]
    pub fn self_frame(&self) -> Frame {
        self.ring.self_head().frame
    }

    /// The oldest frame whose inputs are fully known.
    #[must_use]
    pub fn other_frame(&self) -> Frame {
        self.ring.other().frame
    }

    /// The oldest frame authoritatively acknowledged by the host
    /// (clients only; equal to [`Self::self_frame`] on the host).
    #[must_use]
    pub fn server_frame(&self) -> Frame {
        match self.role {
            Role::Host => self.self_frame(),
            Role::Client => self.ring.server().frame,
        }
    }

    /// The next frame expected from player `slot`, if tracked.
    #[must_use]
    pub fn read_frame(&self, slot: PlayerSlot) -> Option<Frame> {
        self.ring.read(slot).map(|c| c.frame)
    }

    /// CRC-32 of the snapshot held for `frame`, if the frame is still
    /// in the ring with a captured state. For frames at or before the
    /// rollback boundary this is the canonical checksum every peer
    /// must agree on.
    #[must_use]
    pub fn frame_checksum(&self, frame: Frame) -> Option<u32> {
        self.ring.slot(frame).and_then(crate::checksum::slot_crc)
    }

    /// The local participant's mode.
    #[must_use]
    pub fn self_mode(&self) -> PeerMode {
        self.self_mode
    }

    /// The set of player slots currently in the playing set.
    #[must_use]
    pub fn connected_players(&self) -> SlotSet {
        self.connected
    }

    /// Whether the port mapping is flipped at `frame`.
    #[must_use]
    pub fn flip_active(&self, frame: Frame) -> bool {
        self.flip && frame >= self.flip_frame
    }

    /// Maps `slot` through the flip at `frame`: with the flip active,
    /// ports 0 and 1 trade places.
    #[must_use]
    pub fn flipped_slot(&self, slot: PlayerSlot, frame: Frame) -> PlayerSlot {
        if self.flip_active(frame) {
            match slot.as_u8() {
                0 => PlayerSlot::new(1),
                1 => PlayerSlot::new(0),
                _ => slot,
            }
        } else {
            slot
        }
    }

    /// Recorded emulator-core quirks.
    #[must_use]
    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    /// Whether savestates (and therefore rollback and resync) are
    /// available.
    #[must_use]
    pub fn savestates_enabled(&self) -> bool {
        self.state_size > 0 && !self.quirks.contains(Quirks::NO_SAVESTATES)
    }

    /// The local participant paused the session.
    #[must_use]
    pub fn local_paused(&self) -> bool {
        self.local_paused
    }

    /// Some remote peer is paused.
    #[must_use]
    pub fn remote_paused(&self) -> bool {
        self.connections.iter().any(|c| c.is_active() && c.paused)
    }

    /// Whether this session still follows a handshake (client before
    /// SYNC).
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Whether the host should attempt NAT punch-through. The
    /// traversal machinery lives outside this crate; the session only
    /// records the request.
    #[must_use]
    pub fn nat_traversal(&self) -> bool {
        self.nat_traversal
    }

    /// Number of connection records (live or hung up).
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Lifecycle phase of connection `idx`.
    #[must_use]
    pub fn peer_phase(&self, idx: usize) -> Option<HandshakePhase> {
        self.connections.get(idx).map(|c| c.phase)
    }

    /// Playing/spectating tag of connection `idx`.
    #[must_use]
    pub fn peer_mode(&self, idx: usize) -> Option<PeerMode> {
        self.connections.get(idx).map(|c| c.mode)
    }

    /// Display name of connection `idx`.
    #[must_use]
    pub fn peer_nick(&self, idx: usize) -> Option<String> {
        self.connections.get(idx).map(Connection::display_nick)
    }

    /// Drains the queued status notifications.
    pub fn drain_events(&mut self) -> Vec<NetplayEvent> {
        self.events.drain(..).collect()
    }

    pub(crate) fn push_event(&mut self, event: NetplayEvent) {
        self.events.push_back(event);
    }

    /// Largest payload any legal frame may carry right now: sized by
    /// the savestate worst case once the state size is known.
    #[must_use]
    pub(crate) fn max_payload(&self) -> usize {
        let base = (8 + 4 * self.words).max(NICK_LEN).max(64);
        if self.state_size > 0 {
            base.max(8 + self.compressor.worst_case(self.state_size))
        } else {
            base
        }
    }

    // ############
    // #  DRIVING #
    // ############

    /// Drains the network: accepts a pending connection (host), pumps
    /// every stream, and dispatches buffered commands as far as the
    /// data permits.
    ///
    /// With `block` set, waits for progress on the current frame's
    /// missing inputs up to one retry window.
    pub fn poll(&mut self, block: bool) -> Result<(), NetplayError> {
        self.accept_pending();
        self.pump_all();
        if block && !self.inputs_complete() {
            self.wait_for_input();
        }
        Ok(())
    }

    fn accept_pending(&mut self) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        match listener.try_accept() {
            Ok(Some(stream)) => {
                let mut conn = Connection::new(stream);
                debug!("peer connected, starting handshake");
                self.greet(&mut conn);
                self.connections.push(conn);
            },
            Ok(None) => {},
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }

    /// Pumps every connection: flush outbound, read inbound, dispatch
    /// complete frames. Transport failures hang up the one affected
    /// connection; the session continues with the survivors.
    pub(crate) fn pump_all(&mut self) {
        for idx in 0..self.connections.len() {
            if !self.connections[idx].is_active() {
                continue;
            }
            if let Err(e) = self.connections[idx].flush() {
                self.transport_failure(idx, e);
                continue;
            }
            match self.connections[idx].pump_recv() {
                Ok(PumpOutcome::Closed) => {
                    self.peer_hangup(idx);
                    continue;
                },
                Ok(_) => {},
                Err(e) => {
                    self.transport_failure(idx, e);
                    continue;
                },
            }
            self.dispatch_buffered(idx);
            if self.connections[idx].is_active() {
                if let Err(e) = self.connections[idx].flush() {
                    self.transport_failure(idx, e);
                }
            }
        }
    }

    fn transport_failure(&mut self, idx: usize, error: std::io::Error) {
        let nick = self.connections[idx].display_nick();
        warn!(nick = %nick, error = %error, "transport failure");
        self.peer_hangup(idx);
    }

    /// Whether every connected player has delivered input for the
    /// frames the local head needs to keep moving.
    pub(crate) fn inputs_complete(&self) -> bool {
        self.ring.speculation_left() > 0
    }

    fn wait_for_input(&mut self) {
        let deadline = Instant::now() + Duration::from_millis(RETRY_MS);
        loop {
            self.pump_all();
            if self.inputs_complete() {
                self.stall_retries = 0;
                return;
            }
            if Instant::now() >= deadline {
                self.stall_retries += 1;
                trace!(retries = self.stall_retries, "unfruitful input wait");
                return;
            }
            std::thread::sleep(Duration::from_millis(POLL_SLICE_MS));
        }
    }

    /// Runs one local frame: drain, simulate with predictions, emit
    /// local input, then let the sync controller catch up and correct.
    ///
    /// `local_input` is the local participant's sample for this frame;
    /// it is ignored while spectating. Returns without advancing while
    /// the session is paused (either side) or a client handshake is
    /// still in flight.
    ///
    /// # Errors
    /// [`NetplayError::Stall`] after [`MAX_RETRIES`] unfruitful retry
    /// windows with no peer paused.
    pub fn advance_frame<C: EmulatorCore>(
        &mut self,
        core: &mut C,
        local_input: &[u32],
    ) -> Result<(), NetplayError> {
        self.poll(false)?;
        if !self.synced || self.local_paused || self.remote_paused() {
            return Ok(());
        }

        // A pending correction is applied before new speculation.
        if self.force_rewind {
            self.perform_rewind(core);
        }

        // Out of speculation room: the boundary has to move first.
        while !self.inputs_complete() {
            self.poll(true)?;
            self.catch_up(core);
            if self.inputs_complete() {
                break;
            }
            if self.remote_paused() {
                return Ok(());
            }
            if self.stall_retries >= MAX_RETRIES {
                self.stall_retries = 0;
                return Err(NetplayError::Stall {
                    frame: self.self_frame(),
                });
            }
        }

        let frame = self.self_frame();
        self.ring.prepare(frame, self.connected);

        // Sample the local input regardless of mode: a spectator that
        // is later promoted back-fills the host from these samples.
        let mut words: InputWords = InputWords::with_capacity(self.words);
        words.extend_from_slice(local_input);
        words.resize(self.words, 0);
        if let Some(slot) = self.ring.slot_mut(frame) {
            slot.self_state.clone_from(&words);
            slot.have_local = true;
        }
        if let PeerMode::Playing(own) = self.self_mode {
            self.commit_local_input(frame, own, words);
        } else if self.role == Role::Host {
            self.broadcast(&Message::NoInput { frame });
        }

        // Predict everyone who has not arrived yet, snapshot, run.
        input_multiplex::simulate_missing(
            &mut self.ring,
            frame,
            self.connected,
            false,
            self.directional_mask,
        );
        self.capture_state(core, frame);
        self.ring.mark_used(frame)?;
        self.run_core(core, frame);
        self.ring.advance_self();

        self.catch_up(core);
        self.flush_boundary_traffic(core);
        self.ring.check_invariants(self.connected);
        Ok(())
    }

    /// Promotes the local sample to authoritative input and sends it
    /// to every peer.
    ///
    /// Frames that predate our join (behind our own read head) are
    /// left alone: no peer expects input for them, and rewriting them
    /// locally would diverge from the timeline everyone else ran.
    pub(crate) fn commit_local_input(&mut self, frame: Frame, own: PlayerSlot, words: InputWords) {
        if self.ring.read(own).is_some_and(|c| frame < c.frame) {
            return;
        }
        if let Some(slot) = self.ring.slot_mut(frame) {
            slot.real_input[own.as_usize()].clone_from(&words);
            slot.have_real.insert(own);
        }
        if self.ring.read(own).is_some_and(|c| c.frame == frame) {
            self.ring.advance_read(own);
        }
        let msg = Message::Input {
            frame,
            tag: InputTag {
                slot: own,
                from_host: self.role == Role::Host,
            },
            words,
        };
        self.broadcast(&msg);
    }

    pub(crate) fn run_core<C: EmulatorCore>(&mut self, core: &mut C, frame: Frame) {
        let Some(slot) = self.ring.slot(frame) else {
            return;
        };
        let inputs = ResolvedInputs::new(frame, self.connected, slot);
        let guard = self.autosave.lock();
        core.run(&inputs);
        drop(guard);
    }

    /// Serializes the core into the slot for `frame` (the state *at*
    /// that frame, before it runs). No-op when savestates are off.
    pub(crate) fn capture_state<C: EmulatorCore>(&mut self, core: &mut C, frame: Frame) {
        if !self.savestates_enabled() {
            return;
        }
        let size = self.state_size;
        let guard = self.autosave.lock();
        if let Some(slot) = self.ring.slot_mut(frame) {
            if !savestate::capture(core, &mut slot.state, size) {
                slot.state.clear();
                warn!(frame = %frame, "core refused to serialize");
            }
        }
        drop(guard);
    }

    /// Queues `msg` on every established connection.
    pub(crate) fn broadcast(&mut self, msg: &Message) {
        for conn in &mut self.connections {
            if conn.is_active() && conn.phase.is_established() {
                conn.queue(msg);
            }
        }
    }

    /// Queues `msg` on every established connection except `skip`.
    pub(crate) fn broadcast_except(&mut self, msg: &Message, skip: usize) {
        for (idx, conn) in self.connections.iter_mut().enumerate() {
            if idx != skip && conn.is_active() && conn.phase.is_established() {
                conn.queue(msg);
            }
        }
    }

    // ############
    // # CONTROLS #
    // ############

    /// Asks the host for a player slot (clients; the host assigns
    /// itself directly at construction).
    pub fn request_play(&mut self) {
        if self.role == Role::Client && self.self_mode.slot().is_none() {
            self.want_play = true;
            if self.synced {
                if let Some(conn) = self.connections.first_mut() {
                    conn.queue(&Message::Play);
                }
            }
        }
    }

    /// Asks to leave the playing set.
    pub fn request_spectate(&mut self) {
        match self.role {
            Role::Client => {
                if let PeerMode::Playing(_) = self.self_mode {
                    self.want_play = false;
                    self.self_mode = PeerMode::Spectating;
                    if let Some(conn) = self.connections.first_mut() {
                        conn.queue(&Message::Spectate);
                    }
                }
            },
            Role::Host => {
                if let PeerMode::Playing(own) = self.self_mode {
                    let frame = self.read_frame(own).unwrap_or_else(|| self.self_frame());
                    self.connected.remove(own);
                    self.ring.set_read(own, None);
                    self.self_mode = PeerMode::Spectating;
                    self.broadcast(&Message::Mode {
                        frame,
                        tag: crate::protocol::messages::ModeTag {
                            slot: own,
                            you: false,
                            playing: false,
                        },
                    });
                }
            },
        }
    }

    /// Pauses or resumes the local participant. A resume is only
    /// announced once no remote connection remains paused.
    pub fn set_local_pause(&mut self, paused: bool) {
        if self.local_paused == paused {
            return;
        }
        self.local_paused = paused;
        if paused {
            self.broadcast(&Message::Pause);
        } else if !self.remote_paused() {
            self.broadcast(&Message::Resume);
        }
        self.pump_all();
    }

    /// Host only: toggles the port mapping at `at`, defaulting to one
    /// delay budget ahead so every peer sees the flip coming.
    pub fn request_flip(&mut self, at: Option<Frame>) {
        if self.role != Role::Host {
            return;
        }
        let frame = at.unwrap_or_else(|| self.self_frame() + self.ring.delay_frames());
        self.flip = !self.flip;
        self.flip_frame = frame;
        debug!(frame = %frame, flipped = self.flip, "flip players");
        self.broadcast(&Message::FlipPlayers { frame });
    }

    /// Orderly teardown: tells every peer goodbye and hangs up.
    pub fn shutdown(&mut self) {
        self.broadcast(&Message::Disconnect);
        for idx in 0..self.connections.len() {
            let _ = self.connections[idx].flush();
            self.connections[idx].hangup();
        }
        self.self_mode = PeerMode::None;
        self.connected = SlotSet::EMPTY;
    }
}
