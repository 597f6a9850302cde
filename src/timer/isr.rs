use crate::calibration::{CalibrationTracker, ReferenceSource};
use core::cell::RefCell;
use critical_section::Mutex;

/// Used to initialize the global static reference-channel converter for use
/// with `critical_section`.
///
/// The reference converter is owned by the calibration timer interrupt, while
/// startup code has to hand it over; the mutex only ever guards this
/// low-rate, non-real-time peripheral, never the acquisition hot path.
///
/// # Returns
/// * An empty mutable ref-cell
///
/// # Example
/// ```rust
/// # use pqdaq::calibration::ReferenceSource;
/// # struct Vrefint;
/// # impl ReferenceSource for Vrefint {
/// #     type Error = ();
/// #     fn read_reference(&mut self) -> nb::Result<u16, ()> { Ok(24_000) }
/// # }
/// use core::cell::RefCell;
/// use critical_section::Mutex;
/// use pqdaq::timer::global_reference_init;
///
/// static VREFINT: Mutex<RefCell<Option<Vrefint>>> = global_reference_init::<Vrefint>();
/// ```
pub const fn global_reference_init<R: ReferenceSource>() -> Mutex<RefCell<Option<R>>> {
    Mutex::new(RefCell::new(None))
}

/// Moves the reference converter into the global slot.
///
/// # Arguments
/// * The global static created by [`global_reference_init`]
/// * The configured reference-channel converter
///
/// # Example
/// ```rust,ignore
/// fn main() {
///     global_reference_setup(&VREFINT, vrefint);
/// }
/// ```
pub fn global_reference_setup<R: ReferenceSource>(
    global_source: &'static Mutex<RefCell<Option<R>>>,
    source: R,
) {
    critical_section::with(|cs| {
        let _ = global_source.borrow(cs).replace(Some(source));
    });
}

/// Runs one calibration step from the periodic timer interrupt.
///
/// # Arguments
/// * The global static reference converter
/// * The shared calibration tracker
/// * The current time in milliseconds
///
/// # Returns
/// The new supply voltage when a measurement was accepted on this tick.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn TIM7() {
///     global_calibration_tick(&VREFINT, &CALIBRATION, MONO.now_ms());
/// }
/// ```
pub fn global_calibration_tick<R: ReferenceSource>(
    global_source: &'static Mutex<RefCell<Option<R>>>,
    tracker: &CalibrationTracker,
    now_ms: u32,
) -> Option<u16> {
    critical_section::with(|cs| {
        let mut slot = global_source.borrow(cs).borrow_mut();
        let source = slot.as_mut()?;
        tracker.poll(source, now_ms).ok().flatten()
    })
}
