//! Constants used across the acquisition and framing pipeline.
//!
//! This module defines the wire-level framing constants, the packet size
//! arithmetic and the default acquisition parameters.
//!
//! ## Key Concepts
//!
//! - **Markers**: Fixed 16-bit sentinels delimiting a packet in the byte stream.
//!   The start marker sits outside the normal data range of a 12/14-bit
//!   converter; the end marker is distinct from it to aid framing diagnostics.
//! - **Header**: start marker, sequence, sample count and calibration, 2 bytes each.
//! - **Trailer**: checksum and end marker, 2 bytes each.
//! - **Payload**: two de-interleaved arrays of `S` little-endian `u16` values.
//!
//! ```text
//! | start | seq | count | cal_mv | chan_a[S] | chan_b[S] | crc | end |
//!    2      2      2       2       2*S         2*S        2     2
//! ```
//!
//! The checksum covers `[2, 8 + 4*S)`, i.e. everything between the markers
//! except the checksum itself.

/// Start-of-packet sentinel.
pub const START_MARKER: u16 = 0xFFFF;

/// End-of-packet sentinel.
pub const END_MARKER: u16 = 0xFFFE;

/// Length (in bytes) of the fixed packet header, start marker included.
pub const HEADER_LEN: usize = 8;

/// Length (in bytes) of the fixed packet trailer (checksum and end marker).
pub const TRAILER_LEN: usize = 4;

/// Offset of the sequence number.
pub const SEQUENCE_OFFSET: usize = 2;

/// Offset of the sample count.
pub const SAMPLE_COUNT_OFFSET: usize = 4;

/// Offset of the calibration field (reference voltage in millivolts).
pub const CALIBRATION_OFFSET: usize = 6;

/// Offset of the first channel-A value.
pub const PAYLOAD_OFFSET: usize = HEADER_LEN;

/// First byte covered by the checksum.
pub const CRC_COVERAGE_START: usize = SEQUENCE_OFFSET;

/// Total length in bytes of a packet carrying `samples` values per channel.
pub const fn packet_len(samples: usize) -> usize {
    HEADER_LEN + 4 * samples + TRAILER_LEN
}

/// Offset of the checksum for a packet carrying `samples` values per channel.
pub const fn checksum_offset(samples: usize) -> usize {
    HEADER_LEN + 4 * samples
}

/// Number of samples per half-buffer used by the reference board.
///
/// 1000 samples at 10 kHz is one packet every 100 ms.
pub const SAMPLES_PER_HALF: usize = 1000;

/// Packet length for [`SAMPLES_PER_HALF`].
pub const PACKET_LEN: usize = packet_len(SAMPLES_PER_HALF);

/// Default sampling rate of the acquisition timer, in Hz.
pub const SAMPLE_RATE_HZ: u32 = 10_000;

/// Default serial link speed, in bits per second.
pub const BAUD_RATE: u32 = 921_600;

/// Bits on the wire per transmitted byte (8N1 framing).
pub const BITS_PER_UART_BYTE: u32 = 10;

/// Interval between reference-channel measurements, in milliseconds.
pub const CALIBRATION_INTERVAL_MS: u32 = 1_000;

/// Supply voltage at which the factory calibration code was taken, in millivolts.
pub const FACTORY_REFERENCE_MV: u16 = 3_300;

/// Lowest supply voltage accepted as a genuine measurement, in millivolts.
pub const VDDA_MIN_MV: u16 = 1_620;

/// Highest supply voltage accepted as a genuine measurement, in millivolts.
pub const VDDA_MAX_MV: u16 = 3_600;

/// Alignment (in bytes) of the acquisition ring: one 32-bit DMA beat.
pub const RING_ALIGN: usize = 4;

/// Alignment (in bytes) of the packet buffer.
///
/// Byte-wide UART DMA needs none, but word alignment keeps the buffer usable
/// with peripherals that move 32-bit beats.
pub const PACKET_ALIGN: usize = 4;

// Keep the wire layout honest.
const _: () = assert!(packet_len(4) == 28);
const _: () = assert!(checksum_offset(4) == 24);
const _: () = assert!(SAMPLES_PER_HALF <= u16::MAX as usize);
