//! Foreground dispatch loop.
//!
//! This module provides [`Acquisition`], which owns the transport, the
//! acquisition-chain control and the packet encoder, and borrows the four
//! statically allocated pieces shared with interrupt handlers (see
//! [`Resources`]).
//!
//! Each call to [`poll`](Acquisition::poll) performs at most one hand-off:
//!
//! 1. recover from a pending acquisition fault (restart the chain)
//! 2. recover a transport that has been busy longer than the configured
//!    timeout (abort, release the buffer)
//! 3. if the transport is still busy, leave any ready half flagged and return
//! 4. consume the ready half, encode it with the current calibration value,
//!    mark the transport busy and start transmission
//!
//! Halves that complete while the loop is still busy supersede the older
//! one; the older one is never encoded, but its sequence number is burnt so
//! the receiver sees the loss as a gap. A restart after a fault does the same
//! for every half it discards, plus one for the half cut short by the fault.
//!
//! ## Example
//!
//! ```rust
//! use pqdaq::calibration::{CalibrationTracker, FactoryCalibration};
//! use pqdaq::dispatch::{Acquisition, AcquisitionConfig, Resources};
//! use pqdaq::packet::PacketBuffer;
//! use pqdaq::placement::Uncached;
//! use pqdaq::ring::AcquisitionRing;
//! use pqdaq::signals::AcquisitionSignals;
//! use pqdaq::transport::{AcquisitionControl, Transport};
//!
//! struct Uart;
//! impl Transport for Uart {
//!     type Error = ();
//!     fn send(&mut self, _bytes: &[u8]) -> Result<(), ()> { Ok(()) }
//!     fn abort(&mut self) {}
//! }
//!
//! struct Adc;
//! impl AcquisitionControl for Adc {
//!     type Error = ();
//!     fn start(&mut self) -> Result<(), ()> { Ok(()) }
//!     fn restart(&mut self) -> Result<(), ()> { Ok(()) }
//! }
//!
//! static RING: AcquisitionRing<4> = AcquisitionRing::new();
//! static PACKET: PacketBuffer<28> = PacketBuffer::new();
//! static SIGNALS: AcquisitionSignals = AcquisitionSignals::new();
//! static CALIBRATION: CalibrationTracker =
//!     CalibrationTracker::new(FactoryCalibration::at_factory_supply(24_000));
//!
//! let resources = Resources {
//!     ring: &RING,
//!     packet: &PACKET,
//!     signals: &SIGNALS,
//!     calibration: &CALIBRATION,
//! };
//! let mut acq = Acquisition::new(
//!     resources,
//!     Uart,
//!     Adc,
//!     Uncached,
//!     || 0u32,
//!     AcquisitionConfig::default(),
//! );
//! acq.arm().unwrap();
//!
//! SIGNALS.on_half_complete();
//! assert_eq!(acq.poll(), Ok(0));
//! ```

use crate::calibration::{CalibrationTracker, ReferenceSource};
use crate::consts::{SAMPLE_RATE_HZ, SAMPLES_PER_HALF, packet_len};
use crate::error::{Error, Result};
use crate::packet::{PacketBuffer, PacketEncoder};
use crate::placement::CoherencePolicy;
use crate::ring::{AcquisitionRing, DmaTarget};
use crate::signals::{AcquisitionSignals, BufferRegionState};
use crate::timer::{Clock, half_period_us};
use crate::transport::{AcquisitionControl, Transport};
use core::sync::atomic::{Ordering, compiler_fence};

/// Operational state of the dispatch loop, as seen from outside.
///
/// Encoding happens entirely inside one [`poll`](Acquisition::poll) call and
/// is never observable.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum DispatchMode {
    /// [`arm`](Acquisition::arm) has not succeeded yet.
    #[default]
    Unarmed,
    /// Sampling; waiting for the next half to complete.
    WaitingForHalf,
    /// A packet is in flight; the packet buffer must not be touched.
    WaitingForTransport,
    /// A fault was seen and restarting the acquisition chain failed; every
    /// poll retries.
    Faulted,
}

/// Runtime settings.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct AcquisitionConfig {
    /// A transmission still in flight after this many milliseconds is
    /// considered stuck and aborted.
    pub transport_timeout_ms: u32,
}

impl AcquisitionConfig {
    /// Settings for a given buffer geometry: the transport may stay busy for
    /// at most one half period, and never less than 1 ms.
    ///
    /// A zero `sample_rate` gives the longest representable timeout.
    pub const fn for_rate(samples_per_half: usize, sample_rate: u32) -> Self {
        let period_ms = half_period_us(samples_per_half, sample_rate) / 1_000;
        Self {
            transport_timeout_ms: if period_ms == 0 { 1 } else { period_ms },
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self::for_rate(SAMPLES_PER_HALF, SAMPLE_RATE_HZ)
    }
}

/// Counters maintained by the dispatch loop.
///
/// Overruns and alternation faults are counted on the interrupt side, see
/// [`AcquisitionSignals`].
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct Diagnostics {
    /// Packets handed to the transport.
    pub packets_sent: u32,
    /// Polls that found a ready half while the transport was busy.
    pub busy_skips: u32,
    /// Half-buffers acquired but never encoded.
    pub halves_dropped: u32,
    /// Packets discarded because the DMA engine re-entered their half while
    /// it was being encoded.
    pub late_encodes: u32,
    /// Transmissions aborted after exceeding the timeout.
    pub transport_timeouts: u32,
    /// Transmissions the transport refused to start.
    pub transport_errors: u32,
    /// Successful acquisition restarts after a fault.
    pub acquisition_restarts: u32,
}

/// The statically allocated state shared with interrupt handlers.
///
/// `N` must be [`packet_len`]`(S)`; this is checked when the
/// [`Acquisition`] is constructed.
#[derive(Clone, Copy, Debug)]
pub struct Resources<'a, const S: usize, const N: usize> {
    /// Double-buffered sample ring written by the converter DMA.
    pub ring: &'a AcquisitionRing<S>,
    /// Outgoing packet read by the transport DMA.
    pub packet: &'a PacketBuffer<N>,
    /// Hand-off flags.
    pub signals: &'a AcquisitionSignals,
    /// Supply-voltage estimate, refreshed independently of the data path.
    pub calibration: &'a CalibrationTracker,
}

/// The dispatch loop: turns completed half-buffers into transmitted packets.
#[derive(Debug)]
pub struct Acquisition<'a, T, A, P, C, const S: usize, const N: usize>
where
    T: Transport,
    A: AcquisitionControl,
    P: CoherencePolicy,
    C: Clock,
{
    resources: Resources<'a, S, N>,
    transport: T,
    control: A,
    placement: P,
    clock: C,
    config: AcquisitionConfig,
    encoder: PacketEncoder,
    armed: bool,
    restart_pending: bool,
    last_generation: u32,
    tx_started_ms: u32,
    tx_sequence: u16,
    diagnostics: Diagnostics,
}

impl<'a, T, A, P, C, const S: usize, const N: usize> Acquisition<'a, T, A, P, C, S, N>
where
    T: Transport,
    A: AcquisitionControl,
    P: CoherencePolicy,
    C: Clock,
{
    const LAYOUT: () = assert!(N == packet_len(S), "packet buffer must hold packet_len(S) bytes");

    /// Creates an unarmed dispatch loop. Nothing is started until
    /// [`arm`](Self::arm) is called.
    ///
    /// # Arguments
    /// - `resources`: the shared statics
    /// - `transport`: DMA-driven sender for finished packets
    /// - `control`: start/restart of the timer, converters and DMA stream
    /// - `placement`: cache policy matching where the statics are linked
    /// - `clock`: millisecond time base for the transport timeout
    /// - `config`: runtime settings
    pub fn new(
        resources: Resources<'a, S, N>,
        transport: T,
        control: A,
        placement: P,
        clock: C,
        config: AcquisitionConfig,
    ) -> Self {
        let () = Self::LAYOUT;
        Self {
            resources,
            transport,
            control,
            placement,
            clock,
            config,
            encoder: PacketEncoder::new(),
            armed: false,
            restart_pending: false,
            last_generation: resources.signals.generation(),
            tx_started_ms: 0,
            tx_sequence: 0,
            diagnostics: Diagnostics::default(),
        }
    }

    /// Starts the acquisition chain.
    ///
    /// # Returns
    /// The ring's DMA target, for boards that configure the stream after
    /// this call.
    pub fn arm(&mut self) -> Result<DmaTarget> {
        self.resources.signals.reset_acquisition();
        self.control.start().map_err(|_| {
            error!("acquisition chain failed to start");
            Error::AcquisitionStartFailed
        })?;
        self.last_generation = self.resources.signals.generation();
        self.armed = true;
        info!(
            "acquisition armed: {} samples per half, {} byte packets",
            S, N
        );
        Ok(self.resources.ring.dma_target())
    }

    /// Runs one step of the loop.
    ///
    /// # Returns
    /// - `Ok(sequence)` when a packet was encoded and handed to the transport
    /// - `Err(WouldBlock)` when there was nothing to do
    /// - `Err(Other(_))` when a restart or a transmission failed; the loop
    ///   stays usable and later polls carry on
    pub fn poll(&mut self) -> nb::Result<u16, Error> {
        if !self.armed {
            return Err(nb::Error::WouldBlock);
        }
        self.recover_acquisition()?;
        self.recover_transport();

        let signals = self.resources.signals;
        if signals.transport_busy() {
            if signals.region_state() != BufferRegionState::Idle {
                self.diagnostics.busy_skips = self.diagnostics.busy_skips.wrapping_add(1);
            }
            return Err(nb::Error::WouldBlock);
        }
        let Some((half, generation)) = signals.take_ready() else {
            return Err(nb::Error::WouldBlock);
        };
        compiler_fence(Ordering::Acquire);

        let missed = generation.wrapping_sub(self.last_generation).wrapping_sub(1);
        self.last_generation = generation;
        if missed != 0 {
            debug!("{} half-buffers superseded before encoding", missed);
            self.diagnostics.halves_dropped = self.diagnostics.halves_dropped.wrapping_add(missed);
            self.encoder.skip(missed as u16);
        }

        let ring = self.resources.ring;
        // SAFETY: the half was just taken from the signals; the DMA engine
        // is filling the other one.
        let (samples, raw) = unsafe { (ring.half_words(half), ring.half_bytes(half)) };
        self.placement.prepare_cpu_read(raw);

        let calibration_mv = self.resources.calibration.millivolts();
        // SAFETY: the busy flag is clear, so no transmission reads the packet
        // buffer, and this is the only place that writes it.
        let out = unsafe { self.resources.packet.bytes_mut() };
        let (sequence, len) = self
            .encoder
            .encode(samples, calibration_mv, out)
            .map_err(nb::Error::Other)?;

        if signals.generation() != generation {
            self.diagnostics.late_encodes = self.diagnostics.late_encodes.wrapping_add(1);
            warn!("half re-entered by DMA while encoding, packet {} dropped", sequence);
            return Err(nb::Error::WouldBlock);
        }

        let packet = &out[..len];
        self.placement.prepare_dma_read(packet);
        compiler_fence(Ordering::Release);

        signals.mark_transport_busy();
        self.tx_started_ms = self.clock.now_ms();
        self.tx_sequence = sequence;
        match self.transport.send(packet) {
            Ok(()) => {
                self.diagnostics.packets_sent = self.diagnostics.packets_sent.wrapping_add(1);
                trace!("packet {} sent from half {}", sequence, half.index());
                Ok(sequence)
            }
            Err(_) => {
                signals.release_transport();
                self.diagnostics.transport_errors = self.diagnostics.transport_errors.wrapping_add(1);
                warn!("transport refused packet {}", sequence);
                Err(nb::Error::Other(Error::TransportFailed))
            }
        }
    }

    fn recover_acquisition(&mut self) -> nb::Result<(), Error> {
        if self.resources.signals.take_fault() {
            warn!("acquisition fault, restarting");
            self.restart_pending = true;
        }
        if !self.restart_pending {
            return Ok(());
        }
        self.control.restart().map_err(|_| {
            error!("acquisition restart failed");
            nb::Error::Other(Error::AcquisitionRestartFailed)
        })?;
        let signals = self.resources.signals;
        // Halves published but never taken, plus the one cut short by the
        // fault, are lost; burn their numbers so the receiver sees the break.
        let lost = signals.generation().wrapping_sub(self.last_generation).wrapping_add(1);
        self.encoder.skip(lost as u16);
        self.diagnostics.halves_dropped = self.diagnostics.halves_dropped.wrapping_add(lost);
        signals.reset_acquisition();
        self.last_generation = signals.generation();
        self.restart_pending = false;
        self.diagnostics.acquisition_restarts = self.diagnostics.acquisition_restarts.wrapping_add(1);
        info!("acquisition restarted, {} half-buffers lost", lost);
        Ok(())
    }

    fn recover_transport(&mut self) {
        let signals = self.resources.signals;
        if !signals.transport_busy() {
            return;
        }
        let elapsed = self.clock.elapsed_ms(self.tx_started_ms);
        if elapsed <= self.config.transport_timeout_ms {
            return;
        }
        self.transport.abort();
        signals.release_transport();
        self.diagnostics.transport_timeouts = self.diagnostics.transport_timeouts.wrapping_add(1);
        warn!(
            "transport stuck for {} ms, packet {} aborted",
            elapsed, self.tx_sequence
        );
    }

    /// Takes a reference measurement if one is due, for boards that refresh
    /// calibration from the foreground loop instead of a timer interrupt.
    pub fn poll_calibration<R: ReferenceSource>(
        &mut self,
        source: &mut R,
    ) -> nb::Result<Option<u16>, Error> {
        self.resources
            .calibration
            .poll(source, self.clock.now_ms())
    }

    /// Current operational state.
    pub fn mode(&self) -> DispatchMode {
        if !self.armed {
            DispatchMode::Unarmed
        } else if self.restart_pending {
            DispatchMode::Faulted
        } else if self.resources.signals.transport_busy() {
            DispatchMode::WaitingForTransport
        } else {
            DispatchMode::WaitingForHalf
        }
    }

    /// Loop-side counters.
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    /// Halves superseded before they were consumed.
    pub fn overruns(&self) -> u32 {
        self.resources.signals.overruns()
    }

    /// The sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.encoder.next_sequence()
    }

    /// Runtime settings in use.
    pub fn config(&self) -> AcquisitionConfig {
        self.config
    }

    /// Shared statics this loop was built on.
    pub fn resources(&self) -> Resources<'a, S, N> {
        self.resources
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport, mutably. Starting a transmission through this while
    /// the loop is running corrupts the busy flag protocol.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Tears the loop down, returning the owned collaborators.
    pub fn release(self) -> (T, A, P, C) {
        (self.transport, self.control, self.placement, self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::FactoryCalibration;
    use crate::frame::{ParsedPacket, SequenceTracker};
    use crate::placement::{CacheMaintenance, Maintained, Uncached};
    use crate::ring::HalfId;
    use crate::sample::ChannelSampleWord;
    use core::cell::Cell;

    const S: usize = 4;
    const N: usize = packet_len(S);

    #[derive(Default, Debug)]
    struct FakeUart {
        sent: Vec<Vec<u8>>,
        refuse_next: bool,
        aborts: u32,
    }

    impl Transport for FakeUart {
        type Error = ();

        fn send(&mut self, bytes: &[u8]) -> core::result::Result<(), ()> {
            if self.refuse_next {
                self.refuse_next = false;
                return Err(());
            }
            self.sent.push(bytes.to_vec());
            Ok(())
        }

        fn abort(&mut self) {
            self.aborts += 1;
        }
    }

    #[derive(Default, Debug)]
    struct FakeAdc {
        starts: u32,
        restarts: u32,
        failing_restarts: u32,
    }

    impl AcquisitionControl for FakeAdc {
        type Error = ();

        fn start(&mut self) -> core::result::Result<(), ()> {
            self.starts += 1;
            Ok(())
        }

        fn restart(&mut self) -> core::result::Result<(), ()> {
            if self.failing_restarts > 0 {
                self.failing_restarts -= 1;
                return Err(());
            }
            self.restarts += 1;
            Ok(())
        }
    }

    struct Bench {
        ring: AcquisitionRing<S>,
        packet: PacketBuffer<N>,
        signals: AcquisitionSignals,
        calibration: CalibrationTracker,
        now: Cell<u32>,
    }

    impl Bench {
        fn new() -> Self {
            Self {
                ring: AcquisitionRing::new(),
                packet: PacketBuffer::new(),
                signals: AcquisitionSignals::new(),
                calibration: CalibrationTracker::new(FactoryCalibration::at_factory_supply(
                    24_000,
                )),
                now: Cell::new(0),
            }
        }

        fn resources(&self) -> Resources<'_, S, N> {
            Resources {
                ring: &self.ring,
                packet: &self.packet,
                signals: &self.signals,
                calibration: &self.calibration,
            }
        }

        /// Plays the converter DMA: fills `half` and raises its interrupt.
        fn complete(&self, half: HalfId, tag: u16) {
            let target = self.ring.dma_target();
            for i in 0..S {
                let word = ChannelSampleWord::new(tag + i as u16, 0x800 + tag + i as u16);
                // SAFETY: index is inside the ring and nothing borrows this half.
                unsafe {
                    target
                        .address
                        .add(half.index() * S + i)
                        .write_volatile(word.raw());
                }
            }
            match half {
                HalfId::A => self.signals.on_half_complete(),
                HalfId::B => self.signals.on_full_complete(),
            }
        }
    }

    fn acquisition<'a, P: CoherencePolicy>(
        bench: &'a Bench,
        placement: P,
    ) -> Acquisition<'a, FakeUart, FakeAdc, P, impl Fn() -> u32 + 'a, S, N> {
        let now = &bench.now;
        let mut acq = Acquisition::new(
            bench.resources(),
            FakeUart::default(),
            FakeAdc::default(),
            placement,
            move || now.get(),
            AcquisitionConfig {
                transport_timeout_ms: 50,
            },
        );
        let _ = acq.arm().unwrap();
        acq
    }

    fn first_sample(packet: &[u8]) -> u16 {
        ParsedPacket::parse(packet).unwrap().channel_a(0).unwrap()
    }

    #[test]
    fn test_unarmed_does_nothing() {
        let bench = Bench::new();
        let mut acq = Acquisition::new(
            bench.resources(),
            FakeUart::default(),
            FakeAdc::default(),
            Uncached,
            || 0u32,
            AcquisitionConfig::default(),
        );
        bench.complete(HalfId::A, 0);
        assert_eq!(acq.mode(), DispatchMode::Unarmed);
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));

        let target = acq.arm().unwrap();
        assert_eq!(target.words, 2 * S);
        assert_eq!(acq.mode(), DispatchMode::WaitingForHalf);
        // whatever completed before arming is forgotten
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        let (uart, adc, _, _) = acq.release();
        assert!(uart.sent.is_empty());
        assert_eq!(adc.starts, 1);
    }

    #[test]
    fn test_default_config_matches_half_period() {
        assert_eq!(AcquisitionConfig::default().transport_timeout_ms, 100);
        assert_eq!(AcquisitionConfig::for_rate(1, 1_000_000).transport_timeout_ms, 1);
        assert_eq!(
            AcquisitionConfig::for_rate(SAMPLES_PER_HALF, 0).transport_timeout_ms,
            u32::MAX / 1_000
        );
    }

    #[test]
    fn test_half_becomes_packet() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));

        bench.complete(HalfId::A, 100);
        assert_eq!(acq.poll(), Ok(0));
        assert_eq!(acq.mode(), DispatchMode::WaitingForTransport);

        let sent = &acq.transport().sent;
        assert_eq!(sent.len(), 1);
        let parsed = ParsedPacket::parse_expecting(&sent[0], S).unwrap();
        assert_eq!(parsed.sequence(), 0);
        assert_eq!(parsed.calibration_mv(), 3300);
        let pairs: Vec<(u16, u16)> = parsed.pairs().collect();
        assert_eq!(
            pairs,
            vec![(100, 0x864), (101, 0x865), (102, 0x866), (103, 0x867)]
        );
    }

    #[test]
    fn test_busy_transport_leaves_packet_untouched() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        bench.complete(HalfId::A, 1);
        assert_eq!(acq.poll(), Ok(0));
        let in_flight = acq.transport().sent[0].clone();

        bench.complete(HalfId::B, 2);
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        // SAFETY: the loop is not encoding.
        assert_eq!(unsafe { &bench.packet.bytes()[..] }, &in_flight[..]);
        assert_eq!(acq.diagnostics().busy_skips, 2);
        assert_eq!(
            bench.signals.region_state(),
            BufferRegionState::ReadyHalf(HalfId::B)
        );

        bench.signals.on_transport_complete();
        assert_eq!(acq.poll(), Ok(1));
        assert_eq!(first_sample(&acq.transport().sent[1]), 2);
    }

    #[test]
    fn test_sequences_are_consecutive_and_halves_alternate() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        let mut tracker = SequenceTracker::new();
        for cycle in 0..40u16 {
            let half = if cycle % 2 == 0 { HalfId::A } else { HalfId::B };
            bench.complete(half, cycle * 10);
            assert_eq!(acq.poll(), Ok(cycle));
            bench.signals.on_transport_complete();
        }
        for (i, packet) in acq.transport().sent.iter().enumerate() {
            let parsed = ParsedPacket::parse(packet).unwrap();
            assert_eq!(tracker.observe(parsed.sequence()), 0);
            assert_eq!(parsed.channel_a(0), Some(i as u16 * 10));
        }
        assert_eq!(tracker.lost, 0);
        assert_eq!(bench.signals.alternation_faults(), 0);
        assert_eq!(acq.overruns(), 0);
        assert_eq!(acq.diagnostics().packets_sent, 40);
    }

    #[test]
    fn test_overrun_drops_older_half_and_leaves_gap() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        bench.complete(HalfId::A, 1);
        bench.complete(HalfId::B, 2);
        assert_eq!(acq.poll(), Ok(1));
        assert_eq!(first_sample(&acq.transport().sent[0]), 2);
        assert_eq!(acq.overruns(), 1);
        assert_eq!(acq.diagnostics().halves_dropped, 1);
        assert_eq!(acq.next_sequence(), 2);
    }

    #[test]
    fn test_overrun_while_busy_is_counted_once() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        bench.complete(HalfId::A, 1);
        assert_eq!(acq.poll(), Ok(0));
        bench.complete(HalfId::B, 2);
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        bench.complete(HalfId::A, 3);
        bench.signals.on_transport_complete();
        assert_eq!(acq.poll(), Ok(2));
        assert_eq!(first_sample(&acq.transport().sent[1]), 3);
        assert_eq!(acq.overruns(), 1);
        assert_eq!(acq.diagnostics().halves_dropped, 1);
    }

    #[test]
    fn test_stuck_transport_is_aborted() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        bench.now.set(1_000);
        bench.complete(HalfId::A, 1);
        assert_eq!(acq.poll(), Ok(0));

        bench.now.set(1_050);
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        assert_eq!(acq.transport().aborts, 0);

        bench.now.set(1_051);
        bench.complete(HalfId::B, 2);
        assert_eq!(acq.poll(), Ok(1));
        assert_eq!(acq.transport().aborts, 1);
        assert_eq!(acq.diagnostics().transport_timeouts, 1);
        assert_eq!(acq.mode(), DispatchMode::WaitingForTransport);
    }

    #[test]
    fn test_timeout_survives_clock_wrap() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        bench.now.set(u32::MAX - 10);
        bench.complete(HalfId::A, 1);
        assert_eq!(acq.poll(), Ok(0));
        bench.now.set(20);
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        assert_eq!(acq.diagnostics().transport_timeouts, 0);
        bench.now.set(45);
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        assert_eq!(acq.diagnostics().transport_timeouts, 1);
        assert_eq!(acq.mode(), DispatchMode::WaitingForHalf);
    }

    #[test]
    fn test_refused_send_releases_buffer() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        acq.transport_mut().refuse_next = true;
        bench.complete(HalfId::A, 1);
        assert_eq!(acq.poll(), Err(nb::Error::Other(Error::TransportFailed)));
        assert!(!bench.signals.transport_busy());
        assert_eq!(acq.diagnostics().transport_errors, 1);

        bench.complete(HalfId::B, 2);
        assert_eq!(acq.poll(), Ok(1));
    }

    #[test]
    fn test_fault_restarts_acquisition() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        bench.complete(HalfId::A, 1);
        bench.signals.on_acquisition_error();
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        assert_eq!(acq.diagnostics().acquisition_restarts, 1);
        assert_eq!(bench.signals.region_state(), BufferRegionState::Idle);

        // the unconsumed half A and the half cut short by the fault
        assert_eq!(acq.diagnostics().halves_dropped, 2);

        bench.complete(HalfId::A, 5);
        assert_eq!(acq.poll(), Ok(2));
        assert_eq!(first_sample(&acq.transport().sent[0]), 5);
        let (_, adc, _, _) = acq.release();
        assert_eq!(adc.restarts, 1);
    }

    #[test]
    fn test_restart_shows_up_as_sequence_gap() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        let mut tracker = SequenceTracker::new();

        bench.complete(HalfId::A, 1);
        assert_eq!(acq.poll(), Ok(0));
        bench.signals.on_transport_complete();
        bench.complete(HalfId::B, 2);
        bench.signals.on_acquisition_error();
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));

        bench.complete(HalfId::A, 3);
        assert_eq!(acq.poll(), Ok(3));
        bench.signals.on_transport_complete();
        bench.complete(HalfId::B, 4);
        assert_eq!(acq.poll(), Ok(4));

        let gaps: Vec<u16> = acq
            .transport()
            .sent
            .iter()
            .map(|p| tracker.observe(ParsedPacket::parse(p).unwrap().sequence()))
            .collect();
        assert_eq!(gaps, vec![0, 2, 0]);
        assert_eq!(tracker.lost, acq.diagnostics().halves_dropped);
    }

    #[test]
    fn test_restart_with_nothing_pending_burns_one() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        bench.complete(HalfId::A, 1);
        assert_eq!(acq.poll(), Ok(0));
        bench.signals.on_transport_complete();
        bench.signals.on_acquisition_error();
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        assert_eq!(acq.diagnostics().halves_dropped, 1);
        assert_eq!(acq.next_sequence(), 2);
    }

    #[test]
    fn test_failed_restart_is_retried() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        bench.signals.on_acquisition_error();
        acq.control.failing_restarts = 2;
        assert_eq!(
            acq.poll(),
            Err(nb::Error::Other(Error::AcquisitionRestartFailed))
        );
        assert_eq!(acq.mode(), DispatchMode::Faulted);
        assert_eq!(
            acq.poll(),
            Err(nb::Error::Other(Error::AcquisitionRestartFailed))
        );
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        assert_eq!(acq.mode(), DispatchMode::WaitingForHalf);
        assert_eq!(acq.diagnostics().acquisition_restarts, 1);
        assert_eq!(acq.next_sequence(), 1);
    }

    #[test]
    fn test_stale_calibration_is_still_sent() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        assert_eq!(bench.calibration.record(25_000, 0), Ok(3168));
        bench.now.set(60_000);
        bench.complete(HalfId::A, 1);
        assert_eq!(acq.poll(), Ok(0));
        let parsed = ParsedPacket::parse(&acq.transport().sent[0]).unwrap();
        assert_eq!(parsed.calibration_mv(), 3168);
    }

    #[test]
    fn test_foreground_calibration() {
        struct Vrefint;
        impl ReferenceSource for Vrefint {
            type Error = ();
            fn read_reference(&mut self) -> nb::Result<u16, ()> {
                Ok(22_000)
            }
        }

        let bench = Bench::new();
        let mut acq = acquisition(&bench, Uncached);
        assert_eq!(acq.poll_calibration(&mut Vrefint), Ok(Some(3600)));
        bench.complete(HalfId::A, 1);
        assert_eq!(acq.poll(), Ok(0));
        assert_eq!(
            ParsedPacket::parse(&acq.transport().sent[0])
                .unwrap()
                .calibration_mv(),
            3600
        );
    }

    /// Coherence policy that lets the DMA double complete the other half
    /// while the loop is reading its own, i.e. the loop fell a full half
    /// period behind in the middle of an encode.
    struct Racing<'a> {
        bench: &'a Bench,
        armed: bool,
    }

    impl CoherencePolicy for Racing<'_> {
        const MAINTAINS_CACHE: bool = false;

        fn prepare_cpu_read(&mut self, _region: &[u8]) {
            if core::mem::take(&mut self.armed) {
                self.bench.complete(HalfId::B, 9);
            }
        }

        fn prepare_dma_read(&mut self, _region: &[u8]) {}
    }

    #[test]
    fn test_late_encode_is_dropped() {
        let bench = Bench::new();
        let mut acq = acquisition(
            &bench,
            Racing {
                bench: &bench,
                armed: true,
            },
        );
        bench.complete(HalfId::A, 1);
        assert_eq!(acq.poll(), Err(nb::Error::WouldBlock));
        assert!(acq.transport().sent.is_empty());
        assert!(!bench.signals.transport_busy());
        assert_eq!(acq.diagnostics().late_encodes, 1);

        assert_eq!(acq.poll(), Ok(1));
        assert_eq!(first_sample(&acq.transport().sent[0]), 9);
    }

    #[derive(Default, Debug)]
    struct Recorder {
        invalidated: Vec<(usize, usize)>,
        cleaned: Vec<(usize, usize)>,
    }

    impl CacheMaintenance for Recorder {
        const LINE_SIZE: usize = 4;

        fn invalidate(&mut self, address: usize, len: usize) {
            self.invalidated.push((address, len));
        }

        fn clean(&mut self, address: usize, len: usize) {
            self.cleaned.push((address, len));
        }
    }

    #[test]
    fn test_cache_maintenance_brackets_each_packet() {
        let bench = Bench::new();
        let mut acq = acquisition(&bench, Maintained::new(Recorder::default()));
        bench.complete(HalfId::B, 1);
        assert_eq!(acq.poll(), Ok(0));
        let (_, _, placement, _) = acq.release();
        let cache = placement.free();

        let ring = bench.ring.dma_target().address as usize;
        assert_eq!(
            cache.invalidated,
            vec![(ring + AcquisitionRing::<S>::half_len_bytes(), 4 * S)]
        );
        // SAFETY: nothing is encoding.
        let packet = unsafe { bench.packet.bytes() }.as_ptr() as usize;
        assert_eq!(cache.cleaned, vec![(packet, N)]);
    }
}
