//! The inverse of the packet encoder.
//!
//! A receiver scans the byte stream for the start marker, validates the end
//! marker and the checksum, and uses the sequence number to count lost
//! packets. This module provides those checks over an in-memory frame so the
//! wire format can be verified end to end (loopback tests, bench tooling,
//! a second MCU consuming the stream).

use crate::consts::{
    CALIBRATION_OFFSET, CRC_COVERAGE_START, END_MARKER, HEADER_LEN, SAMPLE_COUNT_OFFSET,
    SEQUENCE_OFFSET, START_MARKER, TRAILER_LEN, checksum_offset, packet_len,
};
use crate::crc::crc16;
use crate::error::{Error, Result};
use crate::sample::ChannelSampleWord;

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// A validated view over one packet.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct ParsedPacket<'a> {
    bytes: &'a [u8],
    samples: usize,
}

impl<'a> ParsedPacket<'a> {
    /// Validates the frame at the start of `bytes`.
    ///
    /// Checks, in order: minimum length, start marker, length implied by the
    /// sample count, end marker, checksum. Trailing bytes after the end
    /// marker are ignored.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let min = HEADER_LEN + TRAILER_LEN;
        if bytes.len() < min {
            return Err(Error::Truncated {
                required: min,
                actual: bytes.len(),
            });
        }
        let start = get_u16(bytes, 0);
        if start != START_MARKER {
            return Err(Error::BadStartMarker(start));
        }
        let samples = get_u16(bytes, SAMPLE_COUNT_OFFSET) as usize;
        let len = packet_len(samples);
        if bytes.len() < len {
            return Err(Error::Truncated {
                required: len,
                actual: bytes.len(),
            });
        }
        let end = get_u16(bytes, len - 2);
        if end != END_MARKER {
            return Err(Error::BadEndMarker(end));
        }
        let crc_at = checksum_offset(samples);
        let received = get_u16(bytes, crc_at);
        let computed = crc16(&bytes[CRC_COVERAGE_START..crc_at]);
        if received != computed {
            return Err(Error::ChecksumMismatch { received, computed });
        }
        Ok(Self {
            bytes: &bytes[..len],
            samples,
        })
    }

    /// Like [`parse`](Self::parse), additionally requiring a fixed sample count.
    pub fn parse_expecting(bytes: &'a [u8], samples: usize) -> Result<Self> {
        let packet = Self::parse(bytes)?;
        if packet.samples != samples {
            return Err(Error::SampleCountMismatch {
                expected: samples,
                actual: packet.samples,
            });
        }
        Ok(packet)
    }

    /// Sequence number.
    pub fn sequence(&self) -> u16 {
        get_u16(self.bytes, SEQUENCE_OFFSET)
    }

    /// Samples per channel.
    pub fn sample_count(&self) -> usize {
        self.samples
    }

    /// Supply voltage at encoding time, in millivolts.
    pub fn calibration_mv(&self) -> u16 {
        get_u16(self.bytes, CALIBRATION_OFFSET)
    }

    /// Checksum carried by the frame.
    pub fn checksum(&self) -> u16 {
        get_u16(self.bytes, checksum_offset(self.samples))
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false: a valid frame has at least a header and a trailer.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The validated frame bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Channel A (voltage) reading at `index`.
    pub fn channel_a(&self, index: usize) -> Option<u16> {
        (index < self.samples).then(|| get_u16(self.bytes, HEADER_LEN + 2 * index))
    }

    /// Channel B (current) reading at `index`.
    pub fn channel_b(&self, index: usize) -> Option<u16> {
        (index < self.samples)
            .then(|| get_u16(self.bytes, HEADER_LEN + 2 * self.samples + 2 * index))
    }

    /// Time-aligned `(channel_a, channel_b)` pairs, in sampling order.
    pub fn pairs(&self) -> impl Iterator<Item = (u16, u16)> + 'a {
        let bytes: &'a [u8] = self.bytes;
        let (chan_a, rest) = bytes[HEADER_LEN..].split_at(2 * self.samples);
        let chan_b = &rest[..2 * self.samples];
        chan_a
            .chunks_exact(2)
            .zip(chan_b.chunks_exact(2))
            .map(|(a, b)| (get_u16(a, 0), get_u16(b, 0)))
    }

    /// Re-interleaves the payload into hardware sample words.
    pub fn samples(&self) -> impl Iterator<Item = ChannelSampleWord> + 'a {
        self.pairs().map(|(a, b)| ChannelSampleWord::new(a, b))
    }
}

/// Counts lost packets from successive sequence numbers.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
pub struct SequenceTracker {
    last: Option<u16>,
    /// Packets observed.
    pub received: u32,
    /// Packets missing between observed ones.
    pub lost: u32,
}

impl SequenceTracker {
    /// Creates a tracker that has seen nothing yet.
    pub const fn new() -> Self {
        Self {
            last: None,
            received: 0,
            lost: 0,
        }
    }

    /// Records `sequence` and returns how many packets were skipped since the
    /// previous one, modulo 65536.
    pub fn observe(&mut self, sequence: u16) -> u16 {
        let gap = match self.last {
            Some(last) => sequence.wrapping_sub(last.wrapping_add(1)),
            None => 0,
        };
        self.last = Some(sequence);
        self.received = self.received.wrapping_add(1);
        self.lost = self.lost.wrapping_add(gap as u32);
        gap
    }
}
