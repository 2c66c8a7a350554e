//! End-to-end session scenarios over in-memory streams: handshake and
//! slot assignment, rollback correctness, player flipping, late join,
//! desync recovery, and duplicate-input idempotence.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use rollnet::protocol::messages::{InputTag, Message};
use rollnet::transport::{MemoryListener, MemoryStream};
use rollnet::{
    EmulatorCore, Frame, HandshakePhase, NetplayEvent, NetplaySession, PeerMode, PeerStream,
    PlayerSlot, ResolvedInputs, SessionBuilder, TryIo, MAX_PLAYERS,
};

// ###########
// # HARNESS #
// ###########

/// A deterministic toy simulation: the state is a hash of every input
/// ever applied. Two cores that ran the same frames with the same
/// inputs agree exactly; one divergent word anywhere and they never
/// agree again.
#[derive(Clone)]
struct ToyCore {
    state: u64,
}

impl ToyCore {
    fn new() -> Self {
        ToyCore { state: 0x9E3779B9 }
    }
}

impl EmulatorCore for ToyCore {
    fn serialize_size(&mut self) -> usize {
        8
    }

    fn serialize(&mut self, buf: &mut [u8]) -> bool {
        buf.copy_from_slice(&self.state.to_be_bytes());
        true
    }

    fn unserialize(&mut self, buf: &[u8]) -> bool {
        let Ok(bytes) = <[u8; 8]>::try_from(buf) else {
            return false;
        };
        self.state = u64::from_be_bytes(bytes);
        true
    }

    fn run(&mut self, inputs: &ResolvedInputs<'_>) {
        const NEUTRAL: [u32; 3] = [0; 3];
        let mut acc = self.state;
        for i in 0..MAX_PLAYERS {
            // An absent player must drive the simulation exactly like
            // a present player holding nothing.
            let words = inputs.player(PlayerSlot::new(i as u8)).unwrap_or(&NEUTRAL);
            for word in words {
                acc = acc
                    .wrapping_mul(0x0100_0000_01B3)
                    .wrapping_add(u64::from(*word));
            }
        }
        self.state = acc
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
    }
}

/// A stream whose receive side can be shut or metered, for making one
/// peer fall behind on purpose.
#[derive(Clone)]
struct ValveStream {
    inner: MemoryStream,
    open: Arc<AtomicBool>,
    budget: Arc<AtomicUsize>,
}

impl ValveStream {
    fn new(inner: MemoryStream) -> Self {
        ValveStream {
            inner,
            open: Arc::new(AtomicBool::new(true)),
            budget: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl PeerStream for ValveStream {
    fn try_send(&mut self, bytes: &[u8]) -> std::io::Result<TryIo> {
        self.inner.try_send(bytes)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> std::io::Result<TryIo> {
        if self.open.load(Ordering::SeqCst) {
            return self.inner.try_recv(buf);
        }
        let budget = self.budget.load(Ordering::SeqCst);
        if budget == 0 {
            return Ok(TryIo::WouldBlock);
        }
        let take = budget.min(buf.len());
        match self.inner.try_recv(&mut buf[..take])? {
            TryIo::Done(n) => {
                self.budget.fetch_sub(n, Ordering::SeqCst);
                Ok(TryIo::Done(n))
            },
            other => Ok(other),
        }
    }
}

fn settle<A: PeerStream, B: PeerStream>(
    host: &mut NetplaySession<A>,
    client: &mut NetplaySession<B>,
) {
    for _ in 0..12 {
        host.poll(false).expect("host poll");
        client.poll(false).expect("client poll");
    }
}

struct Pair {
    host: NetplaySession<MemoryStream>,
    client: NetplaySession<ValveStream>,
    host_core: ToyCore,
    client_core: ToyCore,
    /// A clone of the host-side stream end, for injecting raw bytes.
    injector: MemoryStream,
    /// A handle on the host's accept queue, for late joiners.
    listener: MemoryListener,
    valve_open: Arc<AtomicBool>,
    valve_budget: Arc<AtomicUsize>,
}

impl Pair {
    fn lockstep(
        &mut self,
        frames: u32,
        host_input: impl Fn(Frame) -> u32,
        client_input: impl Fn(Frame) -> u32,
    ) {
        for _ in 0..frames {
            let hf = self.host.self_frame();
            self.host
                .advance_frame(&mut self.host_core, &[host_input(hf)])
                .expect("host advance");
            let cf = self.client.self_frame();
            self.client
                .advance_frame(&mut self.client_core, &[client_input(cf)])
                .expect("client advance");
        }
    }

    fn settle(&mut self) {
        settle(&mut self.host, &mut self.client);
    }
}

/// Builds a connected host/client pair and walks the handshake and the
/// first frame, after which the client holds player slot 1.
fn connect(delay_frames: u32, check_frames: u32) -> Pair {
    let listener = MemoryListener::new();
    let (client_end, server_end) = MemoryStream::pair();
    let injector = server_end.clone();
    listener.push(server_end);
    let valved = ValveStream::new(client_end);
    let valve_open = valved.open.clone();
    let valve_budget = valved.budget.clone();

    let mut host_core = ToyCore::new();
    let mut client_core = ToyCore::new();
    let mut host = SessionBuilder::new()
        .with_delay_frames(delay_frames)
        .with_check_frames(check_frames)
        .with_nick("host")
        .start_host_with(listener.clone(), &mut host_core)
        .expect("host start");
    let mut client = SessionBuilder::new()
        .with_delay_frames(delay_frames)
        .with_check_frames(check_frames)
        .with_nick("guest")
        .start_client_with(valved, &mut client_core)
        .expect("client start");

    settle(&mut host, &mut client);
    assert!(client.is_synced(), "handshake did not complete");

    // The first host frame grants the deferred PLAY request.
    host.advance_frame(&mut host_core, &[0])
        .expect("host frame 0");
    client.poll(false).expect("client poll");
    assert_eq!(client.self_mode(), PeerMode::Playing(PlayerSlot::new(1)));

    Pair {
        host,
        client,
        host_core,
        client_core,
        injector,
        listener,
        valve_open,
        valve_budget,
    }
}

fn has_desync(events: &[NetplayEvent]) -> bool {
    events
        .iter()
        .any(|e| matches!(e, NetplayEvent::DesyncSuspected { .. }))
}

// #############
// # SCENARIOS #
// #############

/// Two-peer handshake: the client walks Init to Connected, the host
/// assigns player slot 1 at frame 1.
#[test]
fn two_peer_handshake_assigns_slot_one() {
    let listener = MemoryListener::new();
    let (client_end, server_end) = MemoryStream::pair();
    listener.push(server_end);

    let mut host_core = ToyCore::new();
    let mut client_core = ToyCore::new();
    let mut host = SessionBuilder::new()
        .with_port(55435)
        .with_delay_frames(4)
        .with_nick("host")
        .start_host_with(listener, &mut host_core)
        .expect("host start");
    let mut client = SessionBuilder::new()
        .with_delay_frames(4)
        .with_nick("guest")
        .start_client_with(client_end, &mut client_core)
        .expect("client start");

    assert_eq!(client.peer_phase(0), Some(HandshakePhase::Init));
    assert!(!client.is_synced());

    host.poll(false).expect("accept");
    client.poll(false).expect("hello");
    assert_eq!(client.peer_phase(0), Some(HandshakePhase::PreSync));

    host.poll(false).expect("nick");
    assert_eq!(host.peer_nick(0), Some("guest".to_owned()));
    client.poll(false).expect("sync");
    assert_eq!(client.peer_phase(0), Some(HandshakePhase::Connected));
    assert!(client.is_synced());
    assert_eq!(client.self_mode(), PeerMode::Spectating);

    // The PLAY request is granted at the host's first frame boundary:
    // the assignment lands at frame 1 with the host holding slot 0.
    host.poll(false).expect("play request");
    host.advance_frame(&mut host_core, &[0])
        .expect("host frame 0");
    client.poll(false).expect("mode");

    assert_eq!(client.self_mode(), PeerMode::Playing(PlayerSlot::new(1)));
    assert_eq!(host.self_mode(), PeerMode::Playing(PlayerSlot::new(0)));
    assert_eq!(host.read_frame(PlayerSlot::new(1)), Some(Frame::new(1)));
    assert!(client.drain_events().iter().any(
        |e| matches!(e, NetplayEvent::ConnectedAsPlayer { slot } if *slot == PlayerSlot::new(1))
    ));
    let host_events = host.drain_events();
    assert!(host_events.iter().any(
        |e| matches!(e, NetplayEvent::PeerJoined { slot, nick } if *slot == PlayerSlot::new(1) && nick == "guest")
    ));
}

/// A wrong password is refused during the handshake and the client is
/// dropped.
#[test]
fn wrong_password_is_refused() {
    let listener = MemoryListener::new();
    let (client_end, server_end) = MemoryStream::pair();
    listener.push(server_end);

    let mut host_core = ToyCore::new();
    let mut client_core = ToyCore::new();
    let mut host = SessionBuilder::new()
        .with_password("sesame")
        .start_host_with(listener, &mut host_core)
        .expect("host start");
    let mut client = SessionBuilder::new()
        .with_password("seesaw")
        .start_client_with(client_end, &mut client_core)
        .expect("client start");

    settle(&mut host, &mut client);
    assert!(!client.is_synced());
    assert_eq!(client.peer_phase(0), Some(HandshakePhase::None));
    assert!(client
        .drain_events()
        .iter()
        .any(|e| matches!(e, NetplayEvent::Disconnected { .. })));
}

/// Rollback correctness: the client predicts a quiet host, the host
/// actually pressed a button three frames ago, and after the late
/// input lands both simulations agree again.
#[test]
fn rollback_corrects_late_remote_input() {
    let mut pair = connect(4, 11);

    // Frames 1..10 in lockstep, everyone quiet.
    pair.lockstep(9, |_| 0, |_| 0);

    // The host goes silent on the wire from frame 10 on.
    pair.valve_open.store(false, Ordering::SeqCst);

    // Host presses a button (bit 8) on frame 11 only.
    for _ in 0..4 {
        let f = pair.host.self_frame();
        let press = if f == Frame::new(11) { 0x100 } else { 0 };
        pair.host
            .advance_frame(&mut pair.host_core, &[press])
            .expect("host");
    }
    // The client speculates to its full delay budget on predicted
    // zeros.
    for _ in 0..4 {
        pair.client
            .advance_frame(&mut pair.client_core, &[0])
            .expect("client");
    }
    assert!(pair.client.self_frame() >= Frame::new(13));
    assert!(pair.client.other_frame() <= Frame::new(10));

    // Release the wire; the late inputs force a rewind and replay.
    pair.valve_open.store(true, Ordering::SeqCst);
    pair.settle();
    pair.lockstep(10, |_| 0, |_| 0);
    pair.settle();
    while pair.client.self_frame() < pair.host.self_frame() {
        pair.client
            .advance_frame(&mut pair.client_core, &[0])
            .expect("catch up");
    }
    pair.settle();

    assert_eq!(pair.host.self_frame(), pair.client.self_frame());
    assert_eq!(
        pair.host_core.state, pair.client_core.state,
        "states must reconverge after rollback"
    );
    assert!(!has_desync(&pair.host.drain_events()));
    assert!(!has_desync(&pair.client.drain_events()));
}

/// Resimulation keeps predicted buttons while a rollback is replayed
/// one input at a time.
#[test]
fn partial_release_replays_with_resimulation() {
    let mut pair = connect(4, 1000);

    pair.lockstep(9, |_| 0, |_| 0);
    pair.valve_open.store(false, Ordering::SeqCst);

    for _ in 0..4 {
        let f = pair.host.self_frame();
        let press = if f == Frame::new(11) { 0x100 } else { 0 };
        pair.host
            .advance_frame(&mut pair.host_core, &[press])
            .expect("host");
    }
    for _ in 0..4 {
        pair.client
            .advance_frame(&mut pair.client_core, &[0])
            .expect("client");
    }

    // Let exactly two input frames (frames 10 and 11) through: the
    // client rewinds to the divergence and resimulates 12 and 13.
    let input_frame_len = 8 + 8 + 12;
    pair.valve_budget.store(2 * input_frame_len, Ordering::SeqCst);
    pair.client.poll(false).expect("metered poll");
    pair.client
        .advance_frame(&mut pair.client_core, &[0])
        .expect("client replay");

    // Now open fully and converge.
    pair.valve_open.store(true, Ordering::SeqCst);
    pair.settle();
    pair.lockstep(8, |_| 0, |_| 0);
    pair.settle();
    while pair.client.self_frame() < pair.host.self_frame() {
        pair.client
            .advance_frame(&mut pair.client_core, &[0])
            .expect("catch up");
    }
    pair.settle();

    assert_eq!(pair.host.self_frame(), pair.client.self_frame());
    assert_eq!(pair.host_core.state, pair.client_core.state);
}

/// Player flipping: the mapping toggles exactly at the named frame,
/// and a flip into the already-simulated past is flagged.
#[test]
fn flip_players_takes_effect_at_flip_frame() {
    let mut pair = connect(4, 1000);

    pair.lockstep(97, |_| 1, |_| 2);
    assert!(pair.host.self_frame() >= Frame::new(98));

    pair.host.request_flip(Some(Frame::new(100)));
    pair.settle();

    assert!(!pair.client.flip_active(Frame::new(99)));
    assert!(!pair.host.flip_active(Frame::new(99)));
    assert!(pair.client.flip_active(Frame::new(100)));
    assert!(pair.host.flip_active(Frame::new(100)));
    assert_eq!(
        pair.client.flipped_slot(PlayerSlot::new(0), Frame::new(100)),
        PlayerSlot::new(1)
    );
    assert_eq!(
        pair.client.flipped_slot(PlayerSlot::new(0), Frame::new(99)),
        PlayerSlot::new(0)
    );
    assert!(!pair
        .client
        .drain_events()
        .iter()
        .any(|e| matches!(e, NetplayEvent::FlipRequestedInPast)));

    // Starve the client of host traffic so it speculates ahead, then
    // flip inside its already-simulated window (but not before the
    // host-acknowledged horizon, which would be refused).
    pair.lockstep(10, |_| 1, |_| 2);
    pair.valve_open.store(false, Ordering::SeqCst);
    for _ in 0..3 {
        pair.host
            .advance_frame(&mut pair.host_core, &[1])
            .expect("host");
        pair.client
            .advance_frame(&mut pair.client_core, &[2])
            .expect("client");
    }
    let in_client_past = Frame::new(pair.host.self_frame().as_u32() - 2);
    pair.host.request_flip(Some(in_client_past));
    pair.valve_open.store(true, Ordering::SeqCst);
    pair.settle();
    assert!(pair
        .client
        .drain_events()
        .iter()
        .any(|e| matches!(e, NetplayEvent::FlipRequestedInPast)));
}

/// Late join: a second client connects mid-game, is granted the next
/// free slot one frame past the host's head, and begins contributing
/// input from exactly that frame.
#[test]
fn late_join_grants_next_slot() {
    let mut pair = connect(4, 1000);

    pair.lockstep(199, |_| 3, |_| 4);
    assert_eq!(pair.host.self_frame(), Frame::new(200));

    // Client B dials in at host frame 200.
    let (b_end, server_end) = MemoryStream::pair();
    pair.listener.push(server_end);
    let mut b_core = ToyCore::new();
    let mut client_b = SessionBuilder::new()
        .with_delay_frames(4)
        .with_check_frames(1000)
        .with_nick("late")
        .start_client_with(b_end, &mut b_core)
        .expect("client b start");

    for _ in 0..6 {
        pair.host.poll(false).expect("host poll");
        client_b.poll(false).expect("b poll");
    }
    assert!(client_b.is_synced());

    // The grant happens at the next host boundary: frame 201.
    pair.host
        .advance_frame(&mut pair.host_core, &[3])
        .expect("host frame 200");
    client_b.poll(false).expect("mode");
    pair.client.poll(false).expect("broadcast");

    assert_eq!(client_b.self_mode(), PeerMode::Playing(PlayerSlot::new(2)));
    assert_eq!(
        pair.host.read_frame(PlayerSlot::new(2)),
        Some(Frame::new(201))
    );
    assert!(pair.client.drain_events().iter().any(
        |e| matches!(e, NetplayEvent::PeerJoined { slot, .. } if *slot == PlayerSlot::new(2))
    ));

    // B contributes from frame 201 on.
    for _ in 0..4 {
        pair.host
            .advance_frame(&mut pair.host_core, &[3])
            .expect("host");
        pair.client
            .advance_frame(&mut pair.client_core, &[4])
            .expect("a");
        client_b.advance_frame(&mut b_core, &[5]).expect("b");
    }
    for _ in 0..12 {
        pair.host.poll(false).expect("host poll");
        pair.client.poll(false).expect("a poll");
        client_b.poll(false).expect("b poll");
    }
    assert!(pair.host.read_frame(PlayerSlot::new(2)).expect("b read") > Frame::new(201));
}

/// Desync recovery: a corrupted client is caught by the periodic CRC,
/// asks for a savestate, applies it, and reconverges.
#[test]
fn desync_recovery_via_savestate() {
    let mut pair = connect(4, 10);

    pair.lockstep(44, |f| f.as_u32() % 3, |f| f.as_u32() % 5);

    // The client's simulation silently diverges at frame ~45.
    pair.client_core.state ^= 0xDEAD_BEEF;

    pair.lockstep(30, |f| f.as_u32() % 3, |f| f.as_u32() % 5);
    pair.settle();

    let client_events = pair.client.drain_events();
    let host_events = pair.host.drain_events();
    assert!(
        has_desync(&client_events) || has_desync(&host_events),
        "the CRC exchange must notice the divergence"
    );

    // After the savestate ships and applies, both sides agree again.
    pair.lockstep(20, |f| f.as_u32() % 3, |f| f.as_u32() % 5);
    pair.settle();
    while pair.client.self_frame() < pair.host.self_frame() {
        pair.client
            .advance_frame(&mut pair.client_core, &[0])
            .expect("catch up");
    }
    pair.settle();
    assert_eq!(pair.host.self_frame(), pair.client.self_frame());

    // The newest frames are always speculative; compare the canonical
    // checksum at a frame both rollback boundaries have passed.
    let settled = Frame::new(
        pair.host
            .other_frame()
            .as_u32()
            .min(pair.client.other_frame().as_u32())
            - 1,
    );
    let host_crc = pair.host.frame_checksum(settled).expect("host snapshot");
    let client_crc = pair
        .client
        .frame_checksum(settled)
        .expect("client snapshot");
    assert_eq!(host_crc, client_crc, "savestate resync must restore agreement");
}

/// Duplicate INPUT delivery is idempotent: the read head stays put and
/// nobody is NAKed.
#[test]
fn duplicate_input_is_idempotent() {
    let mut pair = connect(4, 1000);

    pair.lockstep(30, |_| 7, |_| 9);
    pair.settle();
    let read_before = pair
        .client
        .read_frame(PlayerSlot::new(0))
        .expect("host read");
    assert!(read_before >= Frame::new(31));

    // Replay an old host input frame twice, straight onto the wire.
    let dup = Message::Input {
        frame: Frame::new(30),
        tag: InputTag {
            slot: PlayerSlot::new(0),
            from_host: true,
        },
        words: smallvec::smallvec![7, 0, 0],
    };
    let mut bytes = BytesMut::new();
    dup.encode(&mut bytes);
    dup.encode(&mut bytes);
    pair.injector.try_send(&bytes).expect("inject");

    pair.client.poll(false).expect("client poll");
    assert_eq!(
        pair.client.read_frame(PlayerSlot::new(0)),
        Some(read_before),
        "duplicate input must not move the read head"
    );
    assert_eq!(
        pair.client.peer_phase(0),
        Some(HandshakePhase::Connected),
        "duplicate input must not be refused"
    );
}

/// Determinism: a hundred frames of varied input with a tight CRC
/// interval produce no desync reports and identical states.
#[test]
fn checked_frames_agree_across_peers() {
    let mut pair = connect(4, 5);

    pair.lockstep(100, |f| (f.as_u32() * 7) % 32, |f| (f.as_u32() * 13) % 32);
    pair.settle();
    while pair.client.self_frame() < pair.host.self_frame() {
        pair.client
            .advance_frame(&mut pair.client_core, &[0])
            .expect("catch up");
    }
    pair.settle();

    assert!(!has_desync(&pair.host.drain_events()));
    assert!(!has_desync(&pair.client.drain_events()));
    assert_eq!(pair.host.self_frame(), pair.client.self_frame());

    let settled = Frame::new(
        pair.host
            .other_frame()
            .as_u32()
            .min(pair.client.other_frame().as_u32())
            - 1,
    );
    assert_eq!(
        pair.host.frame_checksum(settled),
        pair.client.frame_checksum(settled)
    );
    assert!(pair.host.frame_checksum(settled).is_some());
}

/// Pausing a peer stalls everyone; resuming releases the session.
#[test]
fn pause_stalls_and_resume_releases() {
    let mut pair = connect(4, 1000);

    pair.lockstep(5, |_| 0, |_| 0);

    pair.client.set_local_pause(true);
    pair.host.poll(false).expect("host poll");
    assert!(pair.host.remote_paused());
    assert!(pair
        .host
        .drain_events()
        .iter()
        .any(|e| matches!(e, NetplayEvent::PausedBy { nick } if nick == "guest")));

    let stalled_at = pair.host.self_frame();
    pair.host
        .advance_frame(&mut pair.host_core, &[0])
        .expect("host paused tick");
    assert_eq!(
        pair.host.self_frame(),
        stalled_at,
        "paused sessions do not advance"
    );

    pair.client.set_local_pause(false);
    pair.host.poll(false).expect("host poll");
    assert!(!pair.host.remote_paused());
    assert!(pair
        .host
        .drain_events()
        .iter()
        .any(|e| matches!(e, NetplayEvent::Resumed)));
    pair.host
        .advance_frame(&mut pair.host_core, &[0])
        .expect("host resumed tick");
    assert_eq!(pair.host.self_frame(), stalled_at + 1);
}

/// An orderly client shutdown frees its slot and tells the survivors.
#[test]
fn client_shutdown_frees_slot() {
    let mut pair = connect(4, 1000);

    pair.lockstep(5, |_| 0, |_| 0);

    pair.client.shutdown();
    pair.host.poll(false).expect("host poll");

    assert!(!pair.host.connected_players().contains(PlayerSlot::new(1)));
    assert_eq!(pair.host.read_frame(PlayerSlot::new(1)), None);
    assert!(pair.host.drain_events().iter().any(
        |e| matches!(e, NetplayEvent::PeerLeft { slot, nick } if *slot == PlayerSlot::new(1) && nick == "guest")
    ));

    // The host keeps simulating with the survivors (itself).
    pair.host
        .advance_frame(&mut pair.host_core, &[0])
        .expect("host continues");
}
