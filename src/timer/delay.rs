use crate::dispatch::Acquisition;
use crate::error::Error;
use crate::placement::CoherencePolicy;
use crate::timer::Clock;
use crate::transport::{AcquisitionControl, Transport};
use embedded_hal::delay::DelayNs;

/// Polls the dispatch loop once and parks for `idle_us` when there was
/// nothing to do.
///
/// A packet that was just handed to the transport, or a failed restart or
/// send, returns immediately so the caller can react (or simply call again).
///
/// # Arguments
/// - `acq`: the armed dispatch loop
/// - `delay`: A delay provider implementing `DelayNs`, typically from the HAL
/// - `idle_us`: how long to park when there is no ready half, in microseconds
///
/// # Returns
/// The result of [`Acquisition::poll`], with `WouldBlock` meaning the delay
/// was taken.
pub fn dispatch_step<T, A, P, C, D, const S: usize, const N: usize>(
    acq: &mut Acquisition<'_, T, A, P, C, S, N>,
    delay: &mut D,
    idle_us: u32,
) -> nb::Result<u16, Error>
where
    T: Transport,
    A: AcquisitionControl,
    P: CoherencePolicy,
    C: Clock,
    D: DelayNs,
{
    let result = acq.poll();
    if let Err(nb::Error::WouldBlock) = result {
        delay.delay_us(idle_us);
    }
    result
}

/// Runs a blocking loop that drives the dispatch loop from the foreground.
///
/// This is the simplest way to run the pipeline: the DMA interrupts only set
/// flags, and this loop does the encoding and hand-off between short sleeps.
/// `idle_us` should be well below the half period (100 ms at the default
/// geometry); 1 ms is a reasonable choice.
///
/// # Example
/// ```rust,ignore
/// use pqdaq::timer::run_dispatch_loop;
///
/// acq.arm()?;
/// run_dispatch_loop(&mut acq, &mut delay, 1_000);
/// ```
///
/// # Notes
/// - This loop will never return; it is intended for single-purpose acquisition firmware.
/// - Errors are already logged and counted by the dispatch loop, and every
///   one of them is recovered on a later poll, so they are not surfaced here.
pub fn run_dispatch_loop<T, A, P, C, D, const S: usize, const N: usize>(
    acq: &mut Acquisition<'_, T, A, P, C, S, N>,
    delay: &mut D,
    idle_us: u32,
) -> !
where
    T: Transport,
    A: AcquisitionControl,
    P: CoherencePolicy,
    C: Clock,
    D: DelayNs,
{
    loop {
        let _ = dispatch_step(acq, delay, idle_us);
    }
}
