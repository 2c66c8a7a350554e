//! Savestate capture, restoration, and the compression backend.
//!
//! Rollback lives and dies by the core's serializer. Every frame the
//! session captures a snapshot into the current ring slot before the
//! core runs, so any frame inside the speculation window can be
//! restored and replayed. For resynchronisation the host ships a
//! snapshot over the wire, block-compressed, with the inflated size
//! alongside so the receiver can validate before it touches its slot.
//!
//! Some cores cannot report their serialized size at startup ("quirky"
//! initialisation): the session then runs the core for up to
//! [`INIT_RUN_FRAMES`] frames under the autosave interlock to elicit a
//! serialisable state. If the size never materialises the session
//! degrades permanently to no-savestate operation; it still plays, it
//! just cannot roll back or resync.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::NetplayError;
use crate::input_multiplex::ResolvedInputs;
use crate::{EmulatorCore, Frame};

/// How many frames a quirky core is run to elicit a serialisable
/// state before the session gives up on savestates.
pub const INIT_RUN_FRAMES: u32 = 60;

/// Why a compressed snapshot could not be restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateCompressError;

impl std::fmt::Display for StateCompressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compressed state did not inflate to the promised size")
    }
}

impl std::error::Error for StateCompressError {}

/// The compression backend the savestate path consumes.
///
/// The wire format carries `(inflated_size, bytes)`; the backend only
/// has to turn a whole buffer into a smaller one and back. The default
/// is LZ4 block compression, which trades a few percent of ratio for
/// being effectively free at frame cadence.
pub trait StateCompressor {
    /// Compresses `src` into a fresh buffer.
    fn compress(&mut self, src: &[u8]) -> Vec<u8>;

    /// Decompresses `src`, which must inflate to exactly
    /// `inflated_len` bytes.
    fn decompress(&mut self, src: &[u8], inflated_len: usize)
        -> Result<Vec<u8>, StateCompressError>;

    /// Upper bound on `compress` output for an input of `len` bytes.
    /// Bounds the LOAD_SAVESTATE payload a peer may legally send.
    fn worst_case(&self, len: usize) -> usize;
}

/// LZ4 block compression, the default backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl StateCompressor for Lz4Compressor {
    fn compress(&mut self, src: &[u8]) -> Vec<u8> {
        lz4_flex::block::compress(src)
    }

    fn decompress(
        &mut self,
        src: &[u8],
        inflated_len: usize,
    ) -> Result<Vec<u8>, StateCompressError> {
        let out =
            lz4_flex::block::decompress(src, inflated_len).map_err(|_| StateCompressError)?;
        if out.len() == inflated_len {
            Ok(out)
        } else {
            Err(StateCompressError)
        }
    }

    fn worst_case(&self, len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(len)
    }
}

/// Determines the core's serialized size, running it a while if the
/// size is not yet known.
///
/// The core is run under `autosave`: the embedding frontend may hold
/// the same lock around its own background saves, and the two must not
/// interleave with a mid-frame core.
///
/// # Errors
/// [`NetplayError::StateInit`] when no serialisable state appeared
/// within [`INIT_RUN_FRAMES`] frames; the caller records
/// [`Quirks::NO_SAVESTATES`](crate::Quirks::NO_SAVESTATES) and the
/// session continues without rollback.
pub fn init_serialization<C: EmulatorCore>(
    core: &mut C,
    autosave: &Mutex<()>,
) -> Result<usize, NetplayError> {
    for attempt in 0..=INIT_RUN_FRAMES {
        let size = core.serialize_size();
        if size > 0 {
            if attempt > 0 {
                debug!(size, frames_run = attempt, "serialization initialised late");
            }
            return Ok(size);
        }
        if attempt == INIT_RUN_FRAMES {
            break;
        }
        let guard = autosave.lock();
        core.run(&ResolvedInputs::idle(Frame::ZERO));
        drop(guard);
    }
    warn!(
        frames_run = INIT_RUN_FRAMES,
        "core never produced a serialisable state; savestates disabled"
    );
    Err(NetplayError::StateInit)
}

/// Serializes the core into `buf`, resizing it to `state_size` first.
/// Returns false if the core refuses.
pub fn capture<C: EmulatorCore>(core: &mut C, buf: &mut Vec<u8>, state_size: usize) -> bool {
    buf.resize(state_size, 0);
    core.serialize(buf)
}

/// Restores the core from `buf`. Returns false if the core refuses.
pub fn restore<C: EmulatorCore>(core: &mut C, buf: &[u8]) -> bool {
    core.unserialize(buf)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct ToyCore {
        size_after: u32,
        frames_run: u32,
        state: u64,
    }

    impl EmulatorCore for ToyCore {
        fn serialize_size(&mut self) -> usize {
            if self.frames_run >= self.size_after {
                8
            } else {
                0
            }
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

        fn run(&mut self, _inputs: &ResolvedInputs<'_>) {
            self.frames_run += 1;
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        }
    }

    #[test]
    fn init_immediate_when_size_known() {
        let mut core = ToyCore {
            size_after: 0,
            frames_run: 0,
            state: 1,
        };
        let autosave = Mutex::new(());
        assert_eq!(init_serialization(&mut core, &autosave).unwrap(), 8);
        assert_eq!(core.frames_run, 0, "no warm-up frames needed");
    }

    #[test]
    fn init_runs_quirky_core_until_size_appears() {
        let mut core = ToyCore {
            size_after: 12,
            frames_run: 0,
            state: 1,
        };
        let autosave = Mutex::new(());
        assert_eq!(init_serialization(&mut core, &autosave).unwrap(), 8);
        assert_eq!(core.frames_run, 12);
    }

    #[test]
    fn init_gives_up_after_budget() {
        let mut core = ToyCore {
            size_after: u32::MAX,
            frames_run: 0,
            state: 1,
        };
        let autosave = Mutex::new(());
        assert!(matches!(
            init_serialization(&mut core, &autosave),
            Err(NetplayError::StateInit)
        ));
        assert_eq!(core.frames_run, INIT_RUN_FRAMES);
    }

    #[test]
    fn capture_restore_roundtrip() {
        let mut core = ToyCore {
            size_after: 0,
            frames_run: 0,
            state: 0xABCD_EF01,
        };
        let mut buf = Vec::new();
        assert!(capture(&mut core, &mut buf, 8));
        core.state = 0;
        assert!(restore(&mut core, &buf));
        assert_eq!(core.state, 0xABCD_EF01);
    }

    #[test]
    fn lz4_roundtrip() {
        let mut z = Lz4Compressor;
        let src = vec![7u8; 4096];
        let packed = z.compress(&src);
        assert!(packed.len() < src.len());
        assert!(packed.len() <= z.worst_case(src.len()));
        let back = z.decompress(&packed, src.len()).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn lz4_rejects_wrong_inflated_size() {
        let mut z = Lz4Compressor;
        let packed = z.compress(&[1, 2, 3, 4]);
        assert!(z.decompress(&packed, 3).is_err());
    }

    #[test]
    fn lz4_rejects_garbage() {
        let mut z = Lz4Compressor;
        assert!(z.decompress(&[0xFF, 0xFE, 0xFD], 100).is_err());
    }
}
