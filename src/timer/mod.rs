//! Timing utilities for the acquisition pipeline.
//!
//! Contains the time base used for deadlines, helpers to size the sampling
//! timer and the link budget, and two ways of driving the pipeline:
//!
//! - `timer-isr` feature: a `critical_section`-protected global for the
//!   reference channel, ticked from a ~1 Hz timer interrupt, plus macros that
//!   declare the DMA buffers and signals as statics
//! - `delay-loop` feature: a blocking foreground loop that polls the
//!   dispatcher and parks in a `DelayNs` between polls
//!
//! Helpers:
//! - `compute_timer_reload`: runtime timer reload calculator
//! - `const_timer_reload`: compile-time timer reload calculator
//! - `half_period_us`: time the DMA takes to fill one half-buffer
//! - `packet_airtime_us`: time the UART needs to send one packet
//!
//! Common settings for a 240 MHz timer clock: (For use with the reload calculators)
//!
//! | PRESCALER | RATE (Hz) | RELOAD | Half period (1000 samples) |
//! |-----------|-----------|--------|----------------------------|
//! |         1 |    10 000 | 23 999 | 100 ms |
//! |         1 |    20 000 | 11 999 |  50 ms |
//! |        24 |    10 000 |    999 | 100 ms |

use libm::round;

#[cfg(feature = "delay-loop")]
mod delay;
#[cfg_attr(feature = "delay-loop", allow(unused_imports))]
#[cfg(feature = "delay-loop")]
pub use delay::*;

#[cfg(feature = "timer-isr")]
mod isr;
#[cfg_attr(feature = "timer-isr", allow(unused_imports))]
#[cfg(feature = "timer-isr")]
pub use isr::*;

#[cfg(feature = "timer-isr")]
mod macros;

use crate::consts::BITS_PER_UART_BYTE;

/// 1,000,000 microseconds = 1 second
pub const MICROSECONDS_PER_SECOND: u64 = 1_000_000;

/// A free-running millisecond time base.
///
/// Values wrap at `u32::MAX`; every comparison in the crate uses wrapping
/// arithmetic, so a 49.7-day wrap is harmless.
pub trait Clock {
    /// Milliseconds since an arbitrary epoch.
    fn now_ms(&self) -> u32;

    /// Milliseconds elapsed since `since`.
    fn elapsed_ms(&self, since: u32) -> u32 {
        self.now_ms().wrapping_sub(since)
    }
}

impl<F: Fn() -> u32> Clock for F {
    fn now_ms(&self) -> u32 {
        self()
    }
}

/// Computes the auto-reload value for the sampling timer.
///
/// # Arguments
/// - `f_timer`: timer kernel clock in Hz
/// - `prescaler`: timer prescaler divisor (1 = undivided)
/// - `sample_rate`: desired trigger rate in Hz
///
/// # Returns
/// - Auto-reload value (period minus one, rounded to nearest)
/// - The sample rate actually achieved with that value
///
/// A zero prescaler or sample rate yields `(0, 0.0)`.
pub fn compute_timer_reload(f_timer: u32, prescaler: u32, sample_rate: u32) -> (u32, f32) {
    if prescaler == 0 || sample_rate == 0 {
        return (0, 0.0);
    }
    let ticks_per_second = f_timer as f64 / prescaler as f64;
    let period = round(ticks_per_second / sample_rate as f64).max(1.0);
    ((period as u32) - 1, (ticks_per_second / period) as f32)
}

/// Compile-time timer reload calculator
///
/// Truncates instead of rounding; pick clocks that divide evenly.
pub const fn const_timer_reload(f_timer: u32, prescaler: u32, sample_rate: u32) -> u32 {
    if prescaler == 0 || sample_rate == 0 {
        return 0;
    }
    let period = f_timer / prescaler / sample_rate;
    if period == 0 { 0 } else { period - 1 }
}

/// Time the DMA engine takes to fill one half-buffer, in microseconds.
///
/// Saturates at `u32::MAX`; a stopped timer (`sample_rate == 0`) never
/// completes a half.
pub const fn half_period_us(samples_per_half: usize, sample_rate: u32) -> u32 {
    if sample_rate == 0 {
        return u32::MAX;
    }
    saturate(samples_per_half as u64 * MICROSECONDS_PER_SECOND / sample_rate as u64)
}

/// Time the serial link needs to send `packet_len` bytes, in microseconds.
///
/// Saturates at `u32::MAX`, which is also the answer for `baud == 0`.
pub const fn packet_airtime_us(packet_len: usize, baud: u32) -> u32 {
    if baud == 0 {
        return u32::MAX;
    }
    saturate(packet_len as u64 * BITS_PER_UART_BYTE as u64 * MICROSECONDS_PER_SECOND / baud as u64)
}

const fn saturate(us: u64) -> u32 {
    if us > u32::MAX as u64 { u32::MAX } else { us as u32 }
}

/// Whether one packet can leave before the next half-buffer is ready.
pub const fn link_keeps_up(samples_per_half: usize, sample_rate: u32, baud: u32) -> bool {
    packet_airtime_us(crate::consts::packet_len(samples_per_half), baud)
        < half_period_us(samples_per_half, sample_rate)
}
