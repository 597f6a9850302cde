//! The double-buffered acquisition ring.
//!
//! The DMA engine runs in circular mode over `2 * S` words and raises a
//! half-transfer interrupt after word `S - 1` and a transfer-complete
//! interrupt after word `2 * S - 1`. The two halves are therefore the unit of
//! hand-off between the converter and the encoder: while the engine fills one
//! half the encoder may read the other.
//!
//! The ring holds no logic beyond layout. It is `Sync` so it can live in a
//! `static` (optionally in an uncached linker section, see
//! [`dma_buffers!`](crate::dma_buffers)); the right to read a half is granted
//! by [`AcquisitionSignals`](crate::signals::AcquisitionSignals), never by the
//! ring itself.

use crate::sample::ChannelSampleWord;
use core::cell::UnsafeCell;
use core::fmt;

/// One of the two halves of the acquisition ring.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum HalfId {
    /// Words `0..S`, completed by the half-transfer interrupt.
    A,
    /// Words `S..2S`, completed by the transfer-complete interrupt.
    B,
}

impl HalfId {
    /// The half the engine moves on to after this one.
    pub const fn other(self) -> Self {
        match self {
            HalfId::A => HalfId::B,
            HalfId::B => HalfId::A,
        }
    }

    /// Position of this half within the ring.
    pub const fn index(self) -> usize {
        match self {
            HalfId::A => 0,
            HalfId::B => 1,
        }
    }
}

/// Where the DMA engine should write: base address and length in words.
///
/// Hand this to the peripheral configuration code when arming the stream.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct DmaTarget {
    /// Address of the first word of half A.
    pub address: *mut u32,
    /// Number of 32-bit transfers in one full cycle (`2 * S`).
    pub words: usize,
}

/// A fixed, word-aligned ring of `2 * S` [`ChannelSampleWord`] slots.
#[repr(C, align(4))]
pub struct AcquisitionRing<const S: usize> {
    halves: UnsafeCell<[[ChannelSampleWord; S]; 2]>,
}

// SAFETY: the CPU only ever reads a half after its completion interrupt has
// published it through `AcquisitionSignals`, and only the DMA engine writes.
unsafe impl<const S: usize> Sync for AcquisitionRing<S> {}

impl<const S: usize> AcquisitionRing<S> {
    /// Samples per half-buffer.
    pub const SAMPLES_PER_HALF: usize = S;

    const CHECK: () = {
        assert!(S > 0, "a half-buffer must hold at least one sample");
        assert!(S <= u16::MAX as usize, "sample count must fit the u16 count field");
    };

    /// Creates a zeroed ring. `const` so it can initialise a `static`.
    pub const fn new() -> Self {
        let () = Self::CHECK;
        Self {
            halves: UnsafeCell::new([[ChannelSampleWord::from_raw(0); S]; 2]),
        }
    }

    /// Base address and transfer count for the DMA stream.
    pub fn dma_target(&self) -> DmaTarget {
        DmaTarget {
            address: self.halves.get().cast::<u32>(),
            words: 2 * S,
        }
    }

    /// Size of one half in bytes.
    pub const fn half_len_bytes() -> usize {
        S * size_of::<ChannelSampleWord>()
    }

    /// Borrows the samples of one half.
    ///
    /// # Safety
    /// The caller must hold the hand-off token for `half`: its completion
    /// interrupt has fired and the engine has not wrapped back onto it.
    pub(crate) unsafe fn half_words(&self, half: HalfId) -> &[ChannelSampleWord; S] {
        // SAFETY: see function contract; the other half may be written
        // concurrently but the two arrays never overlap.
        unsafe { &(*self.halves.get())[half.index()] }
    }

    /// Byte view of one half, for cache maintenance.
    ///
    /// # Safety
    /// Same contract as [`half_words`](Self::half_words).
    pub(crate) unsafe fn half_bytes(&self, half: HalfId) -> &[u8] {
        // SAFETY: caller upholds the hand-off contract; the word is a
        // transparent u32 with no padding.
        unsafe {
            let words = self.half_words(half);
            core::slice::from_raw_parts(words.as_ptr().cast::<u8>(), Self::half_len_bytes())
        }
    }

    /// Reads one slot of a half.
    ///
    /// # Safety
    /// Same contract as [`half_words`](Self::half_words).
    pub unsafe fn sample(&self, half: HalfId, index: usize) -> Option<ChannelSampleWord> {
        // SAFETY: forwarded to the caller.
        unsafe { self.half_words(half).get(index).copied() }
    }
}

impl<const S: usize> Default for AcquisitionRing<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const S: usize> fmt::Debug for AcquisitionRing<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionRing")
            .field("samples_per_half", &S)
            .field("address", &self.halves.get())
            .finish()
    }
}
