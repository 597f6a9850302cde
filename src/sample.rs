//! The hardware-packed dual-channel sample.
//!
//! In dual simultaneous mode the converter pair writes one 32-bit common data
//! word per trigger: the master converter (channel A, voltage) in the low
//! half-word and the slave converter (channel B, current) in the high
//! half-word. Both readings come from the same timer edge, so the pair is
//! time-aligned by construction and must stay together until it is
//! de-interleaved into the packet.

/// One simultaneous reading of both channels, as written by the DMA engine.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
#[repr(transparent)]
pub struct ChannelSampleWord(u32);

impl ChannelSampleWord {
    /// Wraps a raw 32-bit data word.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Packs two readings into a data word, channel A in the low half.
    pub const fn new(channel_a: u16, channel_b: u16) -> Self {
        Self((channel_a as u32) | ((channel_b as u32) << 16))
    }

    /// Returns the raw 32-bit word.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Voltage channel reading.
    pub const fn channel_a(self) -> u16 {
        self.0 as u16
    }

    /// Current channel reading.
    pub const fn channel_b(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

impl From<u32> for ChannelSampleWord {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw)
    }
}
