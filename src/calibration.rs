//! Supply/reference voltage tracking.
//!
//! The converters measure relative to VDDA, which drifts with load and
//! temperature. Once per [`CALIBRATION_INTERVAL_MS`] the internal reference
//! channel is converted and the true supply voltage is derived from the
//! factory calibration code:
//!
//! ```text
//! vdda_mv = factory_reference_mv * factory_code / current_reading
//! ```
//!
//! The result is stored as a single atomic scalar. The encoder copies the
//! latest value into every packet; a stale value is acceptable because the
//! supply moves slowly, so there is no freshness requirement on the read side.

use crate::consts::{CALIBRATION_INTERVAL_MS, FACTORY_REFERENCE_MV, VDDA_MAX_MV, VDDA_MIN_MV};
use crate::error::{Error, Result};
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

/// Factory constants for the internal reference channel.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct FactoryCalibration {
    /// Supply voltage at which `code` was measured, in millivolts.
    pub reference_mv: u16,
    /// Raw reference reading stored by the factory (e.g. `VREFINT_CAL`).
    pub code: u16,
}

impl FactoryCalibration {
    /// Calibration taken at the default factory supply of 3.3 V.
    pub const fn at_factory_supply(code: u16) -> Self {
        Self {
            reference_mv: FACTORY_REFERENCE_MV,
            code,
        }
    }

    /// Derives the actual supply voltage from a fresh reference reading.
    pub fn supply_mv(&self, reading: u16) -> Result<u16> {
        if reading == 0 {
            return Err(Error::ZeroReference);
        }
        let mv = (self.reference_mv as u32 * self.code as u32) / reading as u32;
        u16::try_from(mv).map_err(|_| Error::ImplausibleReference(mv))
    }
}

/// Latest reference voltage and when it was measured.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct CalibrationSample {
    /// Supply voltage in millivolts.
    pub reference_millivolts: u16,
    /// Monotonic timestamp of the measurement in milliseconds; 0 until the
    /// first measurement.
    pub last_updated: u32,
}

impl CalibrationSample {
    /// Milliseconds since the measurement, tolerant of timer wrap.
    pub fn age_ms(&self, now_ms: u32) -> u32 {
        now_ms.wrapping_sub(self.last_updated)
    }

    /// Scales a raw converter code to millivolts at the input pin.
    pub fn code_to_millivolts(&self, code: u16, full_scale: u16) -> u16 {
        if full_scale == 0 {
            return 0;
        }
        let mv = code as u32 * self.reference_millivolts as u32 / full_scale as u32;
        mv.min(u16::MAX as u32) as u16
    }
}

/// The dedicated reference-channel converter.
///
/// The first call starts a conversion; subsequent calls return
/// `nb::Error::WouldBlock` until the raw code is available.
pub trait ReferenceSource {
    /// Conversion error reported by the peripheral.
    type Error;

    /// Reads the internal reference channel.
    fn read_reference(&mut self) -> nb::Result<u16, Self::Error>;
}

/// Holds the current supply voltage estimate.
///
/// Written only from the calibration context (a ~1 Hz timer interrupt or the
/// foreground loop), read by the encoder. Share it through a `static` or a
/// plain reference; every method takes `&self`.
#[derive(Debug)]
pub struct CalibrationTracker {
    factory: FactoryCalibration,
    interval_ms: u32,
    millivolts: AtomicU16,
    updated_at: AtomicU32,
    next_due: AtomicU32,
    scheduled: AtomicBool,
    measured: AtomicBool,
    rejected: AtomicU32,
}

impl CalibrationTracker {
    /// Creates a tracker reporting the factory supply voltage until the first
    /// measurement lands.
    pub const fn new(factory: FactoryCalibration) -> Self {
        Self::with_interval(factory, CALIBRATION_INTERVAL_MS)
    }

    /// Same as [`new`](Self::new) with a custom measurement interval.
    pub const fn with_interval(factory: FactoryCalibration, interval_ms: u32) -> Self {
        Self {
            factory,
            interval_ms,
            millivolts: AtomicU16::new(factory.reference_mv),
            updated_at: AtomicU32::new(0),
            next_due: AtomicU32::new(0),
            scheduled: AtomicBool::new(false),
            measured: AtomicBool::new(false),
            rejected: AtomicU32::new(0),
        }
    }

    /// Factory constants in use.
    pub fn factory(&self) -> FactoryCalibration {
        self.factory
    }

    /// Latest snapshot. Never fails, however old the value is.
    pub fn snapshot(&self) -> CalibrationSample {
        CalibrationSample {
            reference_millivolts: self.millivolts.load(Ordering::Acquire),
            last_updated: self.updated_at.load(Ordering::Relaxed),
        }
    }

    /// Latest supply voltage in millivolts.
    pub fn millivolts(&self) -> u16 {
        self.millivolts.load(Ordering::Acquire)
    }

    /// Whether at least one measurement has been accepted.
    pub fn has_measurement(&self) -> bool {
        self.measured.load(Ordering::Relaxed)
    }

    /// Number of readings discarded as zero or implausible.
    pub fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Whether a new measurement is due at `now_ms`.
    ///
    /// Due immediately until the first conversion completes, whatever its
    /// outcome; after that once per interval, rejected readings included.
    pub fn is_due(&self, now_ms: u32) -> bool {
        !self.scheduled.load(Ordering::Relaxed)
            || (now_ms.wrapping_sub(self.next_due.load(Ordering::Relaxed)) as i32) >= 0
    }

    fn schedule_after(&self, now_ms: u32) {
        self.next_due
            .store(now_ms.wrapping_add(self.interval_ms), Ordering::Relaxed);
        self.scheduled.store(true, Ordering::Relaxed);
    }

    /// Converts a raw reference reading and publishes it.
    ///
    /// Readings that are zero or that map outside
    /// `VDDA_MIN_MV..=VDDA_MAX_MV` are rejected and the previous value is
    /// kept.
    pub fn record(&self, reading: u16, now_ms: u32) -> Result<u16> {
        self.schedule_after(now_ms);
        let mv = match self.factory.supply_mv(reading) {
            Ok(mv) if (VDDA_MIN_MV..=VDDA_MAX_MV).contains(&mv) => mv,
            Ok(mv) => return Err(self.reject(Error::ImplausibleReference(mv.into()))),
            Err(e) => return Err(self.reject(e)),
        };
        self.updated_at.store(now_ms, Ordering::Relaxed);
        self.millivolts.store(mv, Ordering::Release);
        self.measured.store(true, Ordering::Relaxed);
        trace!("vdda {} mV", mv);
        Ok(mv)
    }

    fn reject(&self, e: Error) -> Error {
        let n = self.rejected.load(Ordering::Relaxed).wrapping_add(1);
        self.rejected.store(n, Ordering::Relaxed);
        match e {
            Error::ImplausibleReference(mv) => warn!("rejected reference reading: {} mV", mv),
            _ => warn!("rejected zero reference reading"),
        }
        e
    }

    /// Runs one step of the periodic measurement.
    ///
    /// Returns `WouldBlock` when no measurement is due or the conversion is
    /// still running. Peripheral errors are passed through as `Ok(None)` after
    /// being counted, since calibration is best-effort.
    pub fn poll<R: ReferenceSource>(
        &self,
        source: &mut R,
        now_ms: u32,
    ) -> nb::Result<Option<u16>, Error> {
        if !self.is_due(now_ms) {
            return Err(nb::Error::WouldBlock);
        }
        match source.read_reference() {
            Ok(reading) => Ok(self.record(reading, now_ms).ok()),
            Err(nb::Error::WouldBlock) => Err(nb::Error::WouldBlock),
            Err(nb::Error::Other(_)) => {
                self.schedule_after(now_ms);
                let n = self.rejected.load(Ordering::Relaxed).wrapping_add(1);
                self.rejected.store(n, Ordering::Relaxed);
                warn!("reference conversion failed");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // VREFINT_CAL taken at 3.3 V on a 16-bit converter
    const FACTORY: FactoryCalibration = FactoryCalibration::at_factory_supply(24_000);

    struct FakeReference {
        readings: Vec<nb::Result<u16, ()>>,
    }

    impl ReferenceSource for FakeReference {
        type Error = ();

        fn read_reference(&mut self) -> nb::Result<u16, ()> {
            self.readings.remove(0)
        }
    }

    #[test]
    fn test_formula() {
        assert_eq!(FACTORY.supply_mv(24_000), Ok(3_300));
        // A lower reading means a higher supply
        assert_eq!(FACTORY.supply_mv(22_000), Ok(3_600));
        assert_eq!(FACTORY.supply_mv(0), Err(Error::ZeroReference));
    }

    #[test]
    fn test_out_of_range_reports_real_value() {
        let factory = FactoryCalibration {
            reference_mv: 3_300,
            code: 65_535,
        };
        assert_eq!(
            factory.supply_mv(1),
            Err(Error::ImplausibleReference(216_265_500))
        );
        let tracker = CalibrationTracker::new(factory);
        assert_eq!(
            tracker.record(2, 0),
            Err(Error::ImplausibleReference(108_132_750))
        );
        assert_eq!(tracker.millivolts(), 3_300);
    }

    #[test]
    fn test_default_is_factory_supply() {
        let tracker = CalibrationTracker::new(FACTORY);
        assert_eq!(
            tracker.snapshot(),
            CalibrationSample {
                reference_millivolts: 3_300,
                last_updated: 0
            }
        );
        assert!(!tracker.has_measurement());
        assert!(tracker.is_due(0));
    }

    #[test]
    fn test_record_updates_snapshot() {
        let tracker = CalibrationTracker::new(FACTORY);
        assert_eq!(tracker.record(25_000, 1_000), Ok(3_168));
        let snap = tracker.snapshot();
        assert_eq!(snap.reference_millivolts, 3_168);
        assert_eq!(snap.last_updated, 1_000);
        assert_eq!(snap.age_ms(4_500), 3_500);
    }

    #[test]
    fn test_implausible_reading_keeps_previous() {
        let tracker = CalibrationTracker::new(FACTORY);
        let _ = tracker.record(24_000, 10);
        assert_eq!(
            tracker.record(60_000, 20),
            Err(Error::ImplausibleReference(1_320))
        );
        assert_eq!(tracker.record(0, 30), Err(Error::ZeroReference));
        assert_eq!(tracker.millivolts(), 3_300);
        assert_eq!(tracker.snapshot().last_updated, 10);
        assert_eq!(tracker.rejected(), 2);
    }

    #[test]
    fn test_poll_respects_interval() {
        let tracker = CalibrationTracker::with_interval(FACTORY, 1_000);
        let mut source = FakeReference {
            readings: vec![Err(nb::Error::WouldBlock), Ok(24_000), Ok(23_000)],
        };
        assert_eq!(tracker.poll(&mut source, 0), Err(nb::Error::WouldBlock));
        assert_eq!(tracker.poll(&mut source, 1), Ok(Some(3_300)));
        assert_eq!(tracker.poll(&mut source, 500), Err(nb::Error::WouldBlock));
        assert_eq!(tracker.poll(&mut source, 1_001), Ok(Some(3_443)));
        assert!(source.readings.is_empty());
    }

    #[test]
    fn test_poll_survives_peripheral_error() {
        let tracker = CalibrationTracker::new(FACTORY);
        let mut source = FakeReference {
            readings: vec![Err(nb::Error::Other(()))],
        };
        assert_eq!(tracker.poll(&mut source, 5), Ok(None));
        assert_eq!(tracker.millivolts(), 3_300);
        assert_eq!(tracker.rejected(), 1);
    }

    #[test]
    fn test_failing_reference_waits_for_interval() {
        let tracker = CalibrationTracker::with_interval(FACTORY, 1_000);
        let mut source = FakeReference {
            readings: vec![Err(nb::Error::Other(())), Ok(0), Ok(0), Ok(0)],
        };
        assert_eq!(tracker.poll(&mut source, 5), Ok(None));
        for now in 6..=8 {
            assert_eq!(tracker.poll(&mut source, now), Err(nb::Error::WouldBlock));
        }
        assert_eq!(source.readings.len(), 3);

        // zero readings are rejected but still pace the next conversion
        assert_eq!(tracker.poll(&mut source, 1_005), Ok(None));
        assert_eq!(tracker.poll(&mut source, 1_006), Err(nb::Error::WouldBlock));
        assert_eq!(source.readings.len(), 2);
        assert!(!tracker.has_measurement());
        assert_eq!(tracker.rejected(), 2);
        assert_eq!(tracker.millivolts(), 3_300);
    }

    #[test]
    fn test_interval_survives_timer_wrap() {
        let tracker = CalibrationTracker::with_interval(FACTORY, 1_000);
        let _ = tracker.record(24_000, u32::MAX - 100);
        assert!(!tracker.is_due(u32::MAX));
        assert!(tracker.is_due(900));
    }

    #[test]
    fn test_code_scaling() {
        let sample = CalibrationSample {
            reference_millivolts: 3_300,
            last_updated: 0,
        };
        assert_eq!(sample.code_to_millivolts(65_535, 65_535), 3_300);
        assert_eq!(sample.code_to_millivolts(32_768, 65_535), 1_650);
        assert_eq!(sample.code_to_millivolts(1, 0), 0);
    }
}
