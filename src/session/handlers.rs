//! Command and handshake handlers.
//!
//! Every command is handled independently and returns a
//! [`HandlerOutcome`]; the dispatch loop centralises what follows a
//! refusal (NAK, flush, hangup) so no handler can forget it. Handlers
//! validate every field of a message before mutating any session state:
//! a refused command must leave the session exactly as it found it.

use tracing::{debug, trace, warn};

use crate::connection::{Connection, HandshakePhase};
use crate::error::{HandshakeErrorKind, ProtocolErrorKind};
use crate::frame_ring::SlotCrc;
use crate::protocol::messages::{
    InputTag, Message, ModeTag, HELLO_FLAG_PASSWORD, SYNC_FLAG_FLIPPED,
};
use crate::protocol::{Command, HandlerOutcome, MAGIC, PROTOCOL_VERSION};
use crate::session::session::Role;
use crate::transport::PeerStream;
use crate::{
    checksum, Frame, InputWords, NetplayEvent, NetplaySession, PeerMode, PlayerSlot, NICK_LEN,
};

impl<S: PeerStream> NetplaySession<S> {
    /// Opens the handshake on a freshly accepted connection (host
    /// side): the header goes out, the peer's nickname comes next.
    pub(crate) fn greet(&mut self, conn: &mut Connection<S>) {
        let mut flags = 0;
        if self.password.is_some() {
            flags |= HELLO_FLAG_PASSWORD;
        }
        conn.queue(&Message::Hello {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            flags,
        });
        conn.phase = HandshakePhase::PreNick;
        let _ = conn.flush();
    }

    /// Dispatches every complete frame buffered on one connection.
    pub(crate) fn dispatch_buffered(&mut self, idx: usize) {
        loop {
            if !self.connections[idx].is_active() {
                return;
            }
            let max_payload = self.max_payload();
            let raw = match self.connections[idx].next_frame(max_payload) {
                Ok(Some(raw)) => raw,
                Ok(None) => return,
                Err(kind) => {
                    self.nak_hangup(idx, kind);
                    return;
                },
            };
            let msg = match Message::parse(raw, self.words) {
                Ok(msg) => msg,
                Err(kind) => {
                    self.nak_hangup(idx, kind);
                    return;
                },
            };
            let outcome = if self.connections[idx].phase.is_established() {
                self.handle_command(idx, msg)
            } else {
                self.handle_handshake(idx, msg)
            };
            match outcome {
                HandlerOutcome::Handled => {},
                HandlerOutcome::ShortRead => return,
                HandlerOutcome::Nak(kind) => {
                    self.nak_hangup(idx, kind);
                    return;
                },
                HandlerOutcome::Fatal(e) => {
                    warn!(error = %e, "fatal while handling command");
                    self.peer_hangup(idx);
                    return;
                },
            }
        }
    }

    // #############
    // # HANDSHAKE #
    // #############

    fn handle_handshake(&mut self, idx: usize, msg: Message) -> HandlerOutcome {
        if msg == Message::Nak {
            // The peer refused us mid-handshake; just drop.
            self.peer_hangup(idx);
            return HandlerOutcome::Handled;
        }
        match self.role {
            Role::Client => self.client_handshake(idx, msg),
            Role::Host => self.host_handshake(idx, msg),
        }
    }

    fn client_handshake(&mut self, idx: usize, msg: Message) -> HandlerOutcome {
        let phase = self.connections[idx].phase;
        match (phase, msg) {
            (
                HandshakePhase::Init,
                Message::Hello {
                    magic,
                    version,
                    flags,
                },
            ) => {
                if magic != MAGIC {
                    return self.handshake_failure(idx, HandshakeErrorKind::BadMagic { got: magic });
                }
                if version != PROTOCOL_VERSION {
                    return self.handshake_failure(
                        idx,
                        HandshakeErrorKind::VersionMismatch {
                            theirs: version,
                            ours: PROTOCOL_VERSION,
                        },
                    );
                }
                let conn = &mut self.connections[idx];
                conn.phase = HandshakePhase::PreNick;
                let mut nick = self.nick.clone();
                nick.truncate(NICK_LEN);
                conn.queue(&Message::Nick { nick });
                conn.phase = HandshakePhase::PrePassword;
                if flags & HELLO_FLAG_PASSWORD != 0 {
                    let password = self.password.clone().unwrap_or_default();
                    conn.queue(&Message::Password { password });
                }
                conn.phase = HandshakePhase::PreSync;
                HandlerOutcome::Handled
            },
            (
                HandshakePhase::PreSync,
                Message::Sync {
                    frame,
                    connected,
                    flags,
                    flip_frame,
                    words_per_frame,
                    state_size,
                },
            ) => {
                if words_per_frame as usize != self.words {
                    return self.handshake_failure(
                        idx,
                        HandshakeErrorKind::ParameterMismatch {
                            field: "words_per_frame",
                        },
                    );
                }
                if state_size != 0
                    && self.state_size != 0
                    && state_size as usize != self.state_size
                {
                    return self.handshake_failure(
                        idx,
                        HandshakeErrorKind::ParameterMismatch { field: "state_size" },
                    );
                }
                // Adopt the host's timeline wholesale.
                let origin = self.ring.cursor_for(frame);
                self.ring.set_self_head(origin);
                self.ring.set_other(origin);
                self.ring.set_unread(origin);
                self.ring.set_server(origin);
                self.connected = connected;
                self.ring.prepare(frame, connected);
                for p in connected.iter() {
                    self.ring.set_read(p, Some(origin));
                }
                self.flip = flags & SYNC_FLAG_FLIPPED != 0;
                self.flip_frame = flip_frame;
                self.synced = true;
                self.self_mode = PeerMode::Spectating;

                let conn = &mut self.connections[idx];
                conn.phase = HandshakePhase::Connected;
                // The host's own playing status is what slot 0 says.
                conn.mode = if connected.contains(PlayerSlot::HOST) {
                    PeerMode::Playing(PlayerSlot::HOST)
                } else {
                    PeerMode::Spectating
                };
                debug!(frame = %frame, connected = ?connected, "session synchronised");
                if self.want_play {
                    self.connections[idx].queue(&Message::Play);
                } else {
                    self.push_event(NetplayEvent::ConnectedAsSpectator);
                }
                HandlerOutcome::Handled
            },
            (_, other) => self.handshake_failure(
                idx,
                HandshakeErrorKind::UnexpectedCommand {
                    cmd: other.command().to_wire(),
                },
            ),
        }
    }

    fn host_handshake(&mut self, idx: usize, msg: Message) -> HandlerOutcome {
        let phase = self.connections[idx].phase;
        match (phase, msg) {
            (HandshakePhase::PreNick, Message::Nick { mut nick }) => {
                nick.truncate(NICK_LEN);
                self.connections[idx].nick = nick;
                if self.password.is_some() {
                    self.connections[idx].phase = HandshakePhase::PrePassword;
                } else {
                    self.establish(idx);
                }
                HandlerOutcome::Handled
            },
            (HandshakePhase::PrePassword, Message::Password { password }) => {
                if self.password.as_deref() == Some(password.as_str()) {
                    self.establish(idx);
                    HandlerOutcome::Handled
                } else {
                    self.handshake_failure(idx, HandshakeErrorKind::BadPassword)
                }
            },
            (_, other) => self.handshake_failure(
                idx,
                HandshakeErrorKind::UnexpectedCommand {
                    cmd: other.command().to_wire(),
                },
            ),
        }
    }

    /// Completes a host-side handshake: snapshot the session for the
    /// peer, mark it established, and emit the current input batch so
    /// the peer is never missing a frame we already sampled.
    fn establish(&mut self, idx: usize) {
        let frame = self.self_frame();
        let mut flags = 0;
        if self.flip {
            flags |= SYNC_FLAG_FLIPPED;
        }
        let sync = Message::Sync {
            frame,
            connected: self.connected,
            flags,
            flip_frame: self.flip_frame,
            words_per_frame: self.words as u32,
            state_size: self.state_size as u32,
        };
        {
            let conn = &mut self.connections[idx];
            conn.phase = HandshakePhase::PreSync;
            conn.queue(&sync);
            conn.phase = HandshakePhase::Connected;
            conn.mode = PeerMode::Spectating;
        }
        debug!(
            nick = %self.connections[idx].display_nick(),
            frame = %frame,
            "peer established"
        );
        if let PeerMode::Playing(own) = self.self_mode {
            if let Some(slot) = self.ring.slot(frame) {
                if slot.have_local {
                    let msg = Message::Input {
                        frame,
                        tag: InputTag {
                            slot: own,
                            from_host: true,
                        },
                        words: slot.self_state.clone(),
                    };
                    self.connections[idx].queue(&msg);
                }
            }
        }
    }

    fn handshake_failure(&mut self, idx: usize, kind: HandshakeErrorKind) -> HandlerOutcome {
        warn!(error = %kind, "handshake failed");
        let conn = &mut self.connections[idx];
        conn.queue(&Message::Nak);
        let _ = conn.flush();
        self.peer_hangup(idx);
        HandlerOutcome::Handled
    }

    // ############
    // # COMMANDS #
    // ############

    fn handle_command(&mut self, idx: usize, msg: Message) -> HandlerOutcome {
        match msg {
            Message::Ack => HandlerOutcome::Handled,
            Message::Nak => {
                debug!("peer sent NAK, disconnecting it");
                self.peer_hangup(idx);
                HandlerOutcome::Handled
            },
            Message::Input { frame, tag, words } => self.handle_input(idx, frame, tag, words),
            Message::NoInput { frame } => self.handle_noinput(frame),
            Message::FlipPlayers { frame } => self.handle_flip(frame),
            Message::Spectate => self.handle_spectate(idx),
            Message::Play => self.handle_play(idx),
            Message::Mode { frame, tag } => self.handle_mode(frame, tag),
            Message::Disconnect => {
                self.peer_hangup(idx);
                HandlerOutcome::Handled
            },
            Message::Crc { frame, crc } => self.handle_crc(idx, frame, crc),
            Message::RequestSavestate => self.handle_request_savestate(idx),
            Message::LoadSavestate {
                frame,
                inflated_len,
                zbytes,
            } => self.handle_load_savestate(idx, frame, inflated_len, &zbytes),
            Message::Pause => {
                self.connections[idx].paused = true;
                let nick = self.connections[idx].display_nick();
                if self.role == Role::Host {
                    self.broadcast_except(&Message::Pause, idx);
                }
                self.push_event(NetplayEvent::PausedBy { nick });
                HandlerOutcome::Handled
            },
            Message::Resume => {
                self.connections[idx].paused = false;
                if !self.remote_paused() {
                    if self.role == Role::Host && !self.local_paused {
                        self.broadcast_except(&Message::Resume, idx);
                    }
                    if !self.local_paused {
                        self.push_event(NetplayEvent::Resumed);
                    }
                }
                HandlerOutcome::Handled
            },
            other @ (Message::Hello { .. }
            | Message::Nick { .. }
            | Message::Password { .. }
            | Message::Sync { .. }) => HandlerOutcome::Nak(ProtocolErrorKind::WrongDirection {
                cmd: other.command().to_wire(),
            }),
        }
    }

    fn handle_input(
        &mut self,
        idx: usize,
        frame: Frame,
        tag: InputTag,
        words: InputWords,
    ) -> HandlerOutcome {
        let p = tag.slot;
        if !p.is_valid() {
            return HandlerOutcome::Nak(ProtocolErrorKind::InputWrongSlot { slot: p });
        }
        match self.role {
            Role::Host => {
                // A client may neither borrow the host's authority bit
                // nor speak for a slot it does not hold.
                if tag.from_host || self.connections[idx].mode != PeerMode::Playing(p) {
                    return HandlerOutcome::Nak(ProtocolErrorKind::InputWrongSlot { slot: p });
                }
            },
            Role::Client => {
                if !self.connected.contains(p) {
                    return HandlerOutcome::Nak(ProtocolErrorKind::InputWrongSlot { slot: p });
                }
            },
        }
        let Some(read) = self.ring.read(p) else {
            return HandlerOutcome::Nak(ProtocolErrorKind::InputWrongSlot { slot: p });
        };
        if frame < read.frame {
            trace!(frame = %frame, player = %p, "duplicate input dropped");
            return HandlerOutcome::Handled;
        }
        if frame > read.frame {
            return HandlerOutcome::Nak(ProtocolErrorKind::InputOutOfOrder {
                slot: p,
                frame,
                expected: read.frame,
            });
        }
        let self_frame = self.self_frame();
        if frame.since(self_frame) > self.ring.delay_frames() {
            // Accepting it would run the read head out of the ring.
            return HandlerOutcome::Nak(ProtocolErrorKind::InputOutOfOrder {
                slot: p,
                frame,
                expected: self_frame + self.ring.delay_frames(),
            });
        }

        self.ring.prepare(frame, self.connected);
        let mut mispredicted = false;
        if let Some(slot) = self.ring.slot_mut(frame) {
            if frame < self_frame && slot.simulated_input[p.as_usize()] != words {
                mispredicted = true;
            }
            slot.real_input[p.as_usize()].clone_from(&words);
            slot.have_real.insert(p);
        }
        self.ring.advance_read(p);
        if mispredicted {
            trace!(frame = %frame, player = %p, "prediction missed, rewind scheduled");
            self.force_rewind = true;
        }

        match self.role {
            Role::Host => {
                // Authority amplification: the host's copy of a
                // client's input is what the other peers play by.
                if frame <= self_frame {
                    let forward = Message::Input {
                        frame,
                        tag: InputTag {
                            slot: p,
                            from_host: false,
                        },
                        words,
                    };
                    self.broadcast_except(&forward, idx);
                }
            },
            Role::Client => {
                if tag.from_host && frame.next() > self.ring.server().frame {
                    let server = self.ring.cursor_for(frame.next());
                    self.ring.set_server(server);
                }
            },
        }
        HandlerOutcome::Handled
    }

    fn handle_noinput(&mut self, frame: Frame) -> HandlerOutcome {
        if self.role != Role::Client {
            return HandlerOutcome::Nak(ProtocolErrorKind::WrongDirection {
                cmd: Command::NoInput.to_wire(),
            });
        }
        if frame.next() > self.ring.server().frame {
            let server = self.ring.cursor_for(frame.next());
            self.ring.set_server(server);
        }
        HandlerOutcome::Handled
    }

    fn handle_flip(&mut self, frame: Frame) -> HandlerOutcome {
        if self.role != Role::Client {
            return HandlerOutcome::Nak(ProtocolErrorKind::WrongDirection {
                cmd: Command::FlipPlayers.to_wire(),
            });
        }
        let server_frame = self.ring.server().frame;
        if frame < server_frame {
            return HandlerOutcome::Nak(ProtocolErrorKind::FlipBeforeServerFrame {
                flip_frame: frame,
                server_frame,
            });
        }
        self.flip = !self.flip;
        self.flip_frame = frame;
        if frame < self.self_frame() {
            // The flip must materialise even where prediction happened
            // to match.
            self.force_rewind = true;
            self.push_event(NetplayEvent::FlipRequestedInPast);
        }
        debug!(frame = %frame, flipped = self.flip, "players flipped by host");
        HandlerOutcome::Handled
    }

    fn handle_spectate(&mut self, idx: usize) -> HandlerOutcome {
        if self.role != Role::Host {
            return HandlerOutcome::Nak(ProtocolErrorKind::WrongDirection {
                cmd: Command::Spectate.to_wire(),
            });
        }
        let PeerMode::Playing(p) = self.connections[idx].mode else {
            return HandlerOutcome::Nak(ProtocolErrorKind::IllegalModeChange {
                frame: self.self_frame(),
            });
        };
        let frame = self
            .read_frame(p)
            .unwrap_or_else(|| self.self_frame());
        self.connected.remove(p);
        self.ring.set_read(p, None);
        self.connections[idx].mode = PeerMode::Spectating;
        self.connections[idx].wants_play = false;
        let nick = self.connections[idx].display_nick();
        self.broadcast_except(
            &Message::Mode {
                frame,
                tag: ModeTag {
                    slot: p,
                    you: false,
                    playing: false,
                },
            },
            idx,
        );
        self.connections[idx].queue(&Message::Mode {
            frame,
            tag: ModeTag {
                slot: p,
                you: true,
                playing: false,
            },
        });
        self.push_event(NetplayEvent::PeerLeft { slot: p, nick });
        HandlerOutcome::Handled
    }

    fn handle_play(&mut self, idx: usize) -> HandlerOutcome {
        if self.role != Role::Host {
            return HandlerOutcome::Nak(ProtocolErrorKind::WrongDirection {
                cmd: Command::Play.to_wire(),
            });
        }
        if let PeerMode::Playing(_) = self.connections[idx].mode {
            return HandlerOutcome::Nak(ProtocolErrorKind::IllegalModeChange {
                frame: self.self_frame(),
            });
        }
        // Deferred to the frame boundary: the assignment frame must sit
        // just past the input the peer has already been sent.
        self.connections[idx].wants_play = true;
        HandlerOutcome::Handled
    }

    fn handle_mode(&mut self, frame: Frame, tag: ModeTag) -> HandlerOutcome {
        if self.role != Role::Client {
            return HandlerOutcome::Nak(ProtocolErrorKind::WrongDirection {
                cmd: Command::Mode.to_wire(),
            });
        }
        let slot = tag.slot;
        let refuse = HandlerOutcome::Nak(ProtocolErrorKind::IllegalModeChange { frame });
        if !slot.is_valid() {
            return refuse;
        }
        let server_frame = self.ring.server().frame;
        match (tag.you, tag.playing) {
            (true, true) => {
                if frame != server_frame
                    || matches!(self.self_mode, PeerMode::Playing(_))
                    || self.connected.contains(slot)
                {
                    return refuse;
                }
                self.self_mode = PeerMode::Playing(slot);
                self.connected.insert(slot);
                let self_frame = self.self_frame();
                if frame <= self_frame {
                    // Everything we sampled since the assignment frame
                    // becomes our authoritative input, and the host
                    // needs to hear it.
                    let mut backfill = Vec::new();
                    for f in frame.as_u32()..self_frame.as_u32() {
                        let f = Frame::new(f);
                        if let Some(s) = self.ring.slot_mut(f) {
                            if s.have_local {
                                s.real_input[slot.as_usize()].clone_from(&s.self_state);
                                s.have_real.insert(slot);
                                backfill.push((f, s.self_state.clone()));
                            }
                        }
                    }
                    for (f, words) in backfill {
                        let msg = Message::Input {
                            frame: f,
                            tag: InputTag {
                                slot,
                                from_host: false,
                            },
                            words,
                        };
                        if let Some(conn) = self.connections.first_mut() {
                            conn.queue(&msg);
                        }
                    }
                    let read = self.ring.cursor_for(self_frame);
                    self.ring.set_read(slot, Some(read));
                    if frame < self_frame {
                        self.force_rewind = true;
                    }
                } else {
                    // We join in the future: blank our slot until then.
                    for f in self_frame.as_u32()..frame.as_u32() {
                        let f = Frame::new(f);
                        self.ring.prepare(f, self.connected);
                        if let Some(s) = self.ring.slot_mut(f) {
                            s.have_local = true;
                            s.real_input[slot.as_usize()].iter_mut().for_each(|w| *w = 0);
                            s.have_real.insert(slot);
                        }
                    }
                    self.ring.set_read(slot, Some(self.ring.cursor_for(frame)));
                }
                self.push_event(NetplayEvent::ConnectedAsPlayer { slot });
                HandlerOutcome::Handled
            },
            (true, false) => {
                if self.self_mode != PeerMode::Spectating {
                    return refuse;
                }
                // Our former slot leaves the playing set with us.
                if self.connected.contains(slot) {
                    self.connected.remove(slot);
                    self.ring.set_read(slot, None);
                }
                self.push_event(NetplayEvent::ConnectedAsSpectator);
                HandlerOutcome::Handled
            },
            (false, true) => {
                if frame != server_frame || self.connected.contains(slot) {
                    return refuse;
                }
                self.connected.insert(slot);
                let server = self.ring.server();
                self.ring.set_read(slot, Some(server));
                self.push_event(NetplayEvent::PeerJoined {
                    slot,
                    nick: String::new(),
                });
                HandlerOutcome::Handled
            },
            (false, false) => {
                if !self.connected.contains(slot) {
                    return refuse;
                }
                self.connected.remove(slot);
                self.ring.set_read(slot, None);
                self.push_event(NetplayEvent::PeerLeft {
                    slot,
                    nick: String::new(),
                });
                HandlerOutcome::Handled
            },
        }
    }

    fn handle_crc(&mut self, idx: usize, frame: Frame, claimed: u32) -> HandlerOutcome {
        let other_frame = self.other_frame();
        let mismatch = {
            let Some(slot) = self.ring.slot_mut(frame) else {
                trace!(frame = %frame, "CRC for a frame no longer in the ring, dropped");
                return HandlerOutcome::Handled;
            };
            if frame <= other_frame {
                // Fully known: check on the spot.
                checksum::slot_crc(slot).filter(|local| *local != claimed)
            } else {
                // Not fully known yet: stash the claim, the sync
                // controller compares it as the boundary catches up.
                match slot.crc {
                    Some(SlotCrc::Local(local)) => (local != claimed).then_some(local),
                    _ => {
                        slot.crc = Some(SlotCrc::Remote(claimed));
                        None
                    },
                }
            }
        };
        if let Some(local) = mismatch {
            self.desync_detected(idx, frame, local, claimed);
        }
        HandlerOutcome::Handled
    }

    pub(crate) fn desync_detected(&mut self, idx: usize, frame: Frame, local: u32, claimed: u32) {
        warn!(frame = %frame, local, claimed, "checksum mismatch");
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
                // The host is the authority; resync the diverged peer.
                self.connections[idx].wants_savestate = true;
            },
        }
    }

    fn handle_request_savestate(&mut self, idx: usize) -> HandlerOutcome {
        if self.role != Role::Host {
            return HandlerOutcome::Nak(ProtocolErrorKind::WrongDirection {
                cmd: Command::RequestSavestate.to_wire(),
            });
        }
        // Emission waits for the frame boundary so input for the
        // pending frame is not overtaken by the state.
        self.connections[idx].wants_savestate = true;
        HandlerOutcome::Handled
    }

    fn handle_load_savestate(
        &mut self,
        idx: usize,
        frame: Frame,
        inflated_len: u32,
        zbytes: &[u8],
    ) -> HandlerOutcome {
        let refuse = HandlerOutcome::Nak(ProtocolErrorKind::BadSavestate { frame });
        let Some(p) = self.connections[idx].mode.slot() else {
            return refuse;
        };
        let Some(read) = self.ring.read(p) else {
            return refuse;
        };
        if frame != read.frame {
            return refuse;
        }
        if self.state_size == 0 || inflated_len as usize != self.state_size {
            return refuse;
        }
        let Ok(data) = self.compressor.decompress(zbytes, self.state_size) else {
            return refuse;
        };

        // All fields validated; now mutate.
        debug!(frame = %frame, from = %p, "applying savestate");
        self.ring.prepare(frame, self.connected);
        if let Some(slot) = self.ring.slot_mut(frame) {
            slot.state = data;
        }
        let self_frame = self.self_frame();
        if frame > self_frame {
            // Position the head so the upcoming advance lands exactly
            // on the snapshot's frame. A snapshot at or before the
            // head leaves it alone; the boundary rewind propagates the
            // load (wire-compat behaviour).
            if let Some(prev) = frame.prev() {
                let head = self.ring.cursor_for(prev);
                self.ring.set_self_head(head);
            }
        }
        for q in self.connected.iter() {
            if self.ring.read(q).is_some_and(|c| c.frame < frame) {
                self.ring.set_read(q, Some(self.ring.cursor_for(frame)));
            }
        }
        let target = self.ring.cursor_for(frame);
        self.ring.set_other(target);
        if self.ring.unread().frame < frame {
            self.ring.set_unread(target);
        }
        self.savestate_requested = false;
        self.force_rewind = true;
        HandlerOutcome::Handled
    }

    // ############
    // #  HANGUP  #
    // ############

    /// Refuses the peer's last command and hangs it up.
    pub(crate) fn nak_hangup(&mut self, idx: usize, kind: ProtocolErrorKind) {
        warn!(error = %kind, nick = %self.connections[idx].display_nick(), "protocol violation");
        self.connections[idx].queue(&Message::Nak);
        let _ = self.connections[idx].flush();
        self.peer_hangup(idx);
    }

    /// Tears one connection down and restores session bookkeeping.
    pub(crate) fn peer_hangup(&mut self, idx: usize) {
        let nick = self.connections[idx].display_nick();
        let mode = self.connections[idx].mode;
        let was_active = self.connections[idx].is_active();
        self.connections[idx].hangup();
        if !was_active {
            return;
        }
        match self.role {
            Role::Client => {
                self.self_mode = PeerMode::None;
                self.connected = crate::SlotSet::EMPTY;
                self.synced = false;
                self.push_event(NetplayEvent::Disconnected { nick });
            },
            Role::Host => {
                if let PeerMode::Playing(p) = mode {
                    let frame = self
                        .read_frame(p)
                        .unwrap_or_else(|| self.self_frame());
                    self.connected.remove(p);
                    self.ring.set_read(p, None);
                    self.broadcast(&Message::Mode {
                        frame,
                        tag: ModeTag {
                            slot: p,
                            you: false,
                            playing: false,
                        },
                    });
                    self.push_event(NetplayEvent::PeerLeft { slot: p, nick });
                } else {
                    self.push_event(NetplayEvent::Disconnected { nick });
                }
            },
        }
    }
}
