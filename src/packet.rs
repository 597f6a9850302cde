//! Packet encoding.
//!
//! Turns one completed half-buffer into a framed, checksummed packet:
//!
//! 1. header: start marker, sequence (post-increment), sample count, calibration
//! 2. de-interleave: channel A of every word into the first array, channel B
//!    into the second, same index, one pass
//! 3. CRC-16/MODBUS over `[2, 8 + 4*S)`, markers excluded
//! 4. end marker
//!
//! All fields are written explicitly as little-endian `u16`s; nothing relies
//! on the in-memory layout of a Rust struct. The encoder never allocates: it
//! writes into a caller-provided slice, normally the single static
//! [`PacketBuffer`] owned by the dispatch loop.

use crate::consts::{
    CALIBRATION_OFFSET, CRC_COVERAGE_START, END_MARKER, HEADER_LEN, SAMPLE_COUNT_OFFSET,
    SEQUENCE_OFFSET, START_MARKER, checksum_offset, packet_len,
};
use crate::crc::crc16;
use crate::error::{Error, Result};
use crate::sample::ChannelSampleWord;
use core::cell::UnsafeCell;
use core::fmt;

/// Per-packet sequence number, wrapping at 65536.
///
/// Never reset except by a device restart; the host uses it to detect lost
/// packets.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct SequenceCounter(u16);

impl SequenceCounter {
    /// Starts counting at zero.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Starts counting at `value`.
    pub const fn starting_at(value: u16) -> Self {
        Self(value)
    }

    /// The number the next packet will carry.
    pub const fn peek(&self) -> u16 {
        self.0
    }

    /// Returns the current number and advances.
    pub fn advance(&mut self) -> u16 {
        let current = self.0;
        self.0 = current.wrapping_add(1);
        current
    }

    /// Burns `count` numbers for half-buffers that were acquired but never
    /// encoded, so the receiver sees the loss as a gap.
    pub fn skip(&mut self, count: u16) {
        self.0 = self.0.wrapping_add(count);
    }
}

/// Statically allocatable, word-aligned storage for one outgoing packet.
///
/// `N` must equal [`packet_len`]`(S)` for the configured half size; the
/// dispatch loop checks this at compile time. Like the acquisition ring it
/// is `Sync` so it can be placed in an uncached `static`; exclusive access is
/// arbitrated by the transport busy flag.
#[repr(C, align(4))]
pub struct PacketBuffer<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
}

// SAFETY: the encoder writes only while the transport is idle and the
// transport reads only while it is busy.
unsafe impl<const N: usize> Sync for PacketBuffer<N> {}

impl<const N: usize> PacketBuffer<N> {
    /// Total capacity in bytes.
    pub const LEN: usize = N;

    /// Creates a zeroed buffer. `const` so it can initialise a `static`.
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new([0; N]),
        }
    }

    /// Mutable view for the encoder.
    ///
    /// # Safety
    /// No transmission from this buffer may be in flight and no other view
    /// may be live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8; N] {
        // SAFETY: forwarded to the caller.
        unsafe { &mut *self.bytes.get() }
    }

    /// Shared view for the transport and for inspection.
    ///
    /// # Safety
    /// The encoder must not be writing concurrently.
    pub unsafe fn bytes(&self) -> &[u8; N] {
        // SAFETY: forwarded to the caller.
        unsafe { &*self.bytes.get() }
    }
}

impl<const N: usize> Default for PacketBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for PacketBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &N)
            .field("address", &self.bytes.get())
            .finish()
    }
}

/// Builds framed packets and owns the sequence counter.
#[derive(Clone, Default, Debug)]
pub struct PacketEncoder {
    sequence: SequenceCounter,
}

impl PacketEncoder {
    /// Creates an encoder whose first packet carries sequence 0.
    pub const fn new() -> Self {
        Self {
            sequence: SequenceCounter::new(),
        }
    }

    /// Creates an encoder whose first packet carries `sequence`.
    pub const fn with_sequence(sequence: SequenceCounter) -> Self {
        Self { sequence }
    }

    /// The sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequence.peek()
    }

    /// Accounts for `count` half-buffers lost before reaching the encoder.
    pub fn skip(&mut self, count: u16) {
        self.sequence.skip(count);
    }

    /// Encodes one half-buffer into `out`.
    ///
    /// # Arguments
    /// - `samples`: the ready half, one packed word per sampling instant
    /// - `calibration_mv`: latest supply voltage estimate
    /// - `out`: destination, at least [`packet_len`]`(samples.len())` bytes
    ///
    /// # Returns
    /// The sequence number used and the packet length in bytes. On error the
    /// sequence counter is left untouched.
    pub fn encode(
        &mut self,
        samples: &[ChannelSampleWord],
        calibration_mv: u16,
        out: &mut [u8],
    ) -> Result<(u16, usize)> {
        let count = samples.len();
        let count_field = u16::try_from(count).map_err(|_| Error::SampleCountMismatch {
            expected: u16::MAX as usize,
            actual: count,
        })?;
        let len = packet_len(count);
        let available = out.len();
        let out = out.get_mut(..len).ok_or(Error::BufferTooSmall {
            required: len,
            actual: available,
        })?;

        let sequence = self.sequence.advance();
        put_u16(out, 0, START_MARKER);
        put_u16(out, SEQUENCE_OFFSET, sequence);
        put_u16(out, SAMPLE_COUNT_OFFSET, count_field);
        put_u16(out, CALIBRATION_OFFSET, calibration_mv);

        let (chan_a, rest) = out[HEADER_LEN..].split_at_mut(2 * count);
        let (chan_b, _) = rest.split_at_mut(2 * count);
        for ((word, a), b) in samples
            .iter()
            .zip(chan_a.chunks_exact_mut(2))
            .zip(chan_b.chunks_exact_mut(2))
        {
            a.copy_from_slice(&word.channel_a().to_le_bytes());
            b.copy_from_slice(&word.channel_b().to_le_bytes());
        }

        let crc_at = checksum_offset(count);
        let crc = crc16(&out[CRC_COVERAGE_START..crc_at]);
        put_u16(out, crc_at, crc);
        put_u16(out, crc_at + 2, END_MARKER);
        Ok((sequence, len))
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}
