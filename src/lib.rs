//! # Rollnet
//!
//! Rollnet is a client-server rollback netcode core for deterministic
//! emulator-style simulations. Two or more participants co-operatively
//! advance a deterministic core across the network by exchanging
//! per-frame input samples, speculatively advancing the local simulation
//! with predicted remote input, and transparently rewinding and
//! re-running frames when real remote input disagrees with the
//! prediction. One designated host arbitrates player slot assignment,
//! state resynchronisation and peer membership.
//!
//! The crate deliberately owns only the netcode core: the ring buffer of
//! in-flight frames, the wire protocol and its command state machine,
//! the per-peer connection lifecycle, CRC-based desync detection and
//! savestate-driven recovery. The emulated system itself is reached
//! through the narrow [`EmulatorCore`] contract and is assumed to be
//! deterministic: identical input sequences must produce identical
//! state on every peer.
//!
//! The transport is an ordered, reliable byte stream per peer (TCP with
//! Nagle disabled in production, in-memory pipes in tests); the protocol
//! depends on in-order delivery and does not mask reordering.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use connection::HandshakePhase;
pub use error::{HandshakeErrorKind, NetplayError, ProtocolErrorKind, SetupErrorKind};
pub use frame_ring::{FrameRing, FrameSlot};
pub use input_multiplex::ResolvedInputs;
pub use protocol::messages::ModeTag;
pub use savestate::{Lz4Compressor, StateCompressor};
pub use session::builder::SessionBuilder;
pub use session::NetplaySession;
pub use transport::{MemoryStream, PeerStream, StreamListener, TcpPeerStream, TryIo};

use smallvec::SmallVec;

pub mod checksum;
#[doc(hidden)]
pub mod connection;
pub mod error;
#[doc(hidden)]
pub mod frame_ring;
#[doc(hidden)]
pub mod input_multiplex;
#[doc(hidden)]
pub mod protocol;
#[doc(hidden)]
pub mod savestate;
#[doc(hidden)]
pub mod session {
    #[doc(hidden)]
    pub mod builder;
    mod handlers;
    #[doc(hidden)]
    #[allow(clippy::module_inception)]
    pub(crate) mod session;
    pub use session::NetplaySession;
}
#[doc(hidden)]
pub mod sync;
pub mod transport;

// #############
// # CONSTANTS #
// #############

/// Maximum number of player slots a session can arbitrate.
///
/// Slots are carried in the low 16 bits of wire tags, but sessions cap
/// membership well below that: the connected-players set is a 16-bit
/// mask and the host refuses PLAY requests beyond this count.
pub const MAX_PLAYERS: usize = 16;

/// Maximum byte length of a peer nickname on the wire (NUL-padded).
pub const NICK_LEN: usize = 32;

/// How long a blocking poll waits for missing remote input before
/// counting one unfruitful retry, in milliseconds.
pub const RETRY_MS: u64 = 500;

/// Number of consecutive unfruitful waits before the session reports a
/// stall to its host, unless every peer is paused.
pub const MAX_RETRIES: u32 = 16;

/// Default number of 32-bit words in one player's per-frame input
/// sample. Configurable per session via [`SessionBuilder`].
pub const DEFAULT_WORDS_PER_FRAME: usize = 3;

/// Default directional-bit mask applied to word 0 of an input sample
/// during resimulation (see [`input_multiplex`]).
pub const DEFAULT_DIRECTIONAL_MASK: u32 = 0x0F;

/// A logical frame number.
///
/// Frame numbers are monotonically increasing 32-bit counters,
/// independent of any ring index. Frame 0 is the first simulated frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Frame(u32);

impl Frame {
    /// Frame zero, the start of every session.
    pub const ZERO: Frame = Frame(0);

    /// Creates a frame from its raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Frame(frame)
    }

    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The frame immediately after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Frame {
        Frame(self.0 + 1)
    }

    /// The frame immediately before this one, or `None` at frame 0.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Option<Frame> {
        match self.0.checked_sub(1) {
            Some(f) => Some(Frame(f)),
            None => None,
        }
    }

    /// Distance from `earlier` to `self`, saturating at zero when
    /// `earlier` is actually later.
    #[inline]
    #[must_use]
    pub const fn since(self, earlier: Frame) -> u32 {
        self.0.saturating_sub(earlier.0)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: u32) -> Frame {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// A small integer identifying an input producer.
///
/// The host is slot 0 by convention; additional peers occupy 1..N. On
/// the wire a slot travels in the low 16 bits of a `u32` tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PlayerSlot(u8);

impl PlayerSlot {
    /// The host's conventional slot.
    pub const HOST: PlayerSlot = PlayerSlot(0);

    /// Creates a slot from its raw index. Values at or above
    /// [`MAX_PLAYERS`] are never assigned by a session but may appear in
    /// hostile wire traffic; validation happens at the protocol layer.
    #[inline]
    #[must_use]
    pub const fn new(slot: u8) -> Self {
        PlayerSlot(slot)
    }

    /// Returns the raw slot index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns the raw slot index as a `u8`.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Whether this slot is usable in a session.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_PLAYERS
    }
}

impl std::fmt::Display for PlayerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of player slots, packed into a 16-bit mask.
///
/// This is the session's connected-players bitset and also backs the
/// per-slot bookkeeping inside ring slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SlotSet(u16);

impl SlotSet {
    /// The empty set.
    pub const EMPTY: SlotSet = SlotSet(0);

    /// Creates a set from a raw mask.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        SlotSet(bits)
    }

    /// Returns the raw mask.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Whether `slot` is in the set.
    #[inline]
    #[must_use]
    pub const fn contains(self, slot: PlayerSlot) -> bool {
        self.0 & (1 << slot.0) != 0
    }

    /// Inserts `slot`.
    #[inline]
    pub fn insert(&mut self, slot: PlayerSlot) {
        self.0 |= 1 << slot.0;
    }

    /// Removes `slot`.
    #[inline]
    pub fn remove(&mut self, slot: PlayerSlot) {
        self.0 &= !(1 << slot.0);
    }

    /// Whether the set is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the slots in the set, ascending.
    pub fn iter(self) -> impl Iterator<Item = PlayerSlot> {
        (0..MAX_PLAYERS as u8)
            .map(PlayerSlot::new)
            .filter(move |s| self.contains(*s))
    }

    /// The lowest slot not in the set and different from `exclude`, if
    /// one exists below [`MAX_PLAYERS`].
    #[must_use]
    pub fn lowest_free(self, exclude: PlayerSlot) -> Option<PlayerSlot> {
        (0..MAX_PLAYERS as u8)
            .map(PlayerSlot::new)
            .find(|s| !self.contains(*s) && *s != exclude)
    }
}

/// One player's input sample for one frame: a fixed-width sequence of
/// 32-bit words. The width is session-wide (`words_per_frame`).
pub type InputWords = SmallVec<[u32; 4]>;

/// Known non-ideal emulator-core properties, recorded as bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Quirks(u8);

impl Quirks {
    /// The core cannot produce savestates; rollback and resync are
    /// permanently disabled for the session.
    pub const NO_SAVESTATES: Quirks = Quirks(1);
    /// Savestates exist but must not be transmitted to peers.
    pub const NO_TRANSMISSION: Quirks = Quirks(2);
    /// The core's serialized size is unknown until it has run a while
    /// ("quirky" initialisation).
    pub const INITIALIZATION: Quirks = Quirks(4);

    /// No quirks.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Quirks(0)
    }

    /// Whether every quirk in `other` is set in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Quirks) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets every quirk in `other`.
    #[inline]
    pub fn set(&mut self, other: Quirks) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Quirks {
    type Output = Quirks;

    #[inline]
    fn bitor(self, rhs: Quirks) -> Quirks {
        Quirks(self.0 | rhs.0)
    }
}

/// What a connected peer is doing in the session.
///
/// These are tags overlaid on an established connection, not handshake
/// states: a peer is fully connected whether it plays or watches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum PeerMode {
    /// Not attached to a session (or torn down).
    #[default]
    None,
    /// Connected, receiving frames, contributing no input.
    Spectating,
    /// Connected and occupying a player slot.
    Playing(PlayerSlot),
}

impl PeerMode {
    /// The occupied player slot, if playing.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> Option<PlayerSlot> {
        match self {
            PeerMode::Playing(slot) => Some(slot),
            PeerMode::Spectating | PeerMode::None => None,
        }
    }
}

/// Status notifications queued for the embedding frontend.
///
/// The session never terminates its host process; everything
/// user-visible is reported through this queue instead.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NetplayEvent {
    /// The local participant was assigned a player slot.
    ConnectedAsPlayer {
        /// The assigned slot.
        slot: PlayerSlot,
    },
    /// The local participant joined as a spectator.
    ConnectedAsSpectator,
    /// A remote peer took a player slot.
    PeerJoined {
        /// The slot the peer now occupies.
        slot: PlayerSlot,
        /// The peer's nickname.
        nick: String,
    },
    /// A remote peer left its player slot (spectate or hangup).
    PeerLeft {
        /// The slot the peer vacated.
        slot: PlayerSlot,
        /// The peer's nickname.
        nick: String,
    },
    /// The session lost its connection (client) or a peer hung up.
    Disconnected {
        /// The nickname of the affected peer, if known.
        nick: String,
    },
    /// A peer paused; the session stalls until everyone resumes.
    PausedBy {
        /// The pausing peer's nickname.
        nick: String,
    },
    /// All peers resumed.
    Resumed,
    /// The host asked us to flip player ports at a frame we have
    /// already simulated past.
    FlipRequestedInPast,
    /// A CRC comparison failed; a savestate resync is underway.
    DesyncSuspected {
        /// The frame whose checksums disagreed.
        frame: Frame,
    },
}

// #############
// #  TRAITS   #
// #############

/// The deterministic simulation the session drives.
///
/// The contract is narrow by design: the session only ever asks the
/// core to report its serialized size, to serialize or restore a
/// snapshot, and to advance exactly one frame with a fully resolved
/// input set. Determinism is assumed, not checked: given the same
/// snapshot and the same input sequence, every peer's core must reach
/// the same state.
///
/// `serialize_size` may return 0 early in the core's life (delayed
/// initialisation); the session then runs the core under its autosave
/// interlock until a size materialises, or degrades the session with
/// [`Quirks::NO_SAVESTATES`] after 60 frames.
///
/// Players join and leave mid-session, and different peers learn of a
/// join at different frames. Determinism survives this only if an
/// absent player and a present player with all-zero input drive the
/// simulation identically, so `run` must treat a `None` slot exactly
/// like a neutral sample.
pub trait EmulatorCore {
    /// Size in bytes of a serialized snapshot, or 0 if not yet known.
    fn serialize_size(&mut self) -> usize;

    /// Writes a snapshot into `buf`; returns false on refusal.
    /// `buf.len()` equals the last reported `serialize_size`.
    fn serialize(&mut self, buf: &mut [u8]) -> bool;

    /// Restores a snapshot previously produced by `serialize` (on any
    /// peer); returns false on refusal.
    fn unserialize(&mut self, buf: &[u8]) -> bool;

    /// Advances the simulation one frame using `inputs`, the resolved
    /// per-slot input samples for that frame.
    fn run(&mut self, inputs: &ResolvedInputs<'_>);
}
