//! Error type shared by the encoder, the frame parser, the calibration tracker
//! and the dispatch loop.
//!
//! None of these errors reach an operator. They are either recovered locally
//! (restart a subsystem, drop a packet) or exist so that a consumer of the
//! byte stream can reject a frame.

use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the acquisition and framing pipeline.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Error {
    /// The output buffer cannot hold a full packet.
    #[error("buffer too small: need {required} bytes, have {actual}")]
    BufferTooSmall {
        /// Bytes needed
        required: usize,
        /// Bytes available
        actual: usize,
    },

    /// The declared or supplied sample count does not match the configuration.
    #[error("sample count mismatch: expected {expected}, got {actual}")]
    SampleCountMismatch {
        /// Configured samples per half-buffer
        expected: usize,
        /// Samples found
        actual: usize,
    },

    /// The first two bytes of a frame are not the start marker.
    #[error("bad start marker 0x{0:04x}")]
    BadStartMarker(u16),

    /// The last two bytes of a frame are not the end marker.
    #[error("bad end marker 0x{0:04x}")]
    BadEndMarker(u16),

    /// The checksum carried by a frame does not match its contents.
    #[error("checksum mismatch: received 0x{received:04x}, computed 0x{computed:04x}")]
    ChecksumMismatch {
        /// CRC read from the frame
        received: u16,
        /// CRC recomputed over the covered bytes
        computed: u16,
    },

    /// The input ends before the frame does.
    #[error("truncated frame: need {required} bytes, have {actual}")]
    Truncated {
        /// Bytes needed for the declared sample count
        required: usize,
        /// Bytes available
        actual: usize,
    },

    /// The reference channel read back zero, so no supply voltage can be derived.
    #[error("reference channel returned zero")]
    ZeroReference,

    /// The derived supply voltage is outside the plausible window.
    #[error("implausible reference voltage {0} mV")]
    ImplausibleReference(u32),

    /// The transport refused to start a transmission.
    #[error("transport rejected the packet")]
    TransportFailed,

    /// The acquisition chain could not be started.
    #[error("acquisition start failed")]
    AcquisitionStartFailed,

    /// The acquisition chain could not be restarted after a fault.
    #[error("acquisition restart failed")]
    AcquisitionRestartFailed,
}
