//! # pqdaq
//!
//! A portable, no_std acquisition and framing core for dual-channel
//! power-quality data acquisition (one voltage and one current channel,
//! sampled simultaneously).
//!
//! The crate covers everything between "the DMA engine wrote a sample word"
//! and "a framed packet is on the wire":
//! - a double-buffered acquisition ring filled by DMA in circular mode
//! - interrupt-safe hand-off flags using only atomic loads and stores
//! - a cache placement policy for DMA-visible buffers
//! - a CRC-16/MODBUS packet encoder and a matching host-side parser
//! - periodic supply-voltage calibration from the internal reference channel
//! - a non-blocking dispatch loop with stuck-transport and fault recovery
//!
//! Peripheral setup (clocks, pins, timer, converters, UART, DMA streams) is
//! left to the board support layer, which implements
//! [`transport::Transport`] and [`transport::AcquisitionControl`].
//!
//! ## Crate features
//! | Feature               | Description |
//! |-----------------------|-------------|
//! | `std`                 | Disables `#![no_std]` and enables `std` support in dependencies |
//! | `delay-loop`          | Blocking foreground loop driven by `embedded_hal::delay::DelayNs` |
//! | `timer-isr` (default) | `critical_section` globals for the calibration timer interrupt and the buffer macros |
//! | `defmt-0-3`           | Uses `defmt` logging |
//! | `log`                 | Uses `log` logging |
//!
//! ## Wire format
//!
//! All fields little-endian, `S` samples per channel:
//!
//! | Offset     | Size | Field |
//! |------------|------|-------|
//! | 0          | 2    | start marker `0xFFFF` |
//! | 2          | 2    | sequence number |
//! | 4          | 2    | sample count `S` |
//! | 6          | 2    | supply voltage, mV |
//! | 8          | 2·S  | channel A samples |
//! | 8 + 2·S    | 2·S  | channel B samples |
//! | 8 + 4·S    | 2    | CRC-16/MODBUS over bytes `[2, 8 + 4·S)` |
//! | 10 + 4·S   | 2    | end marker `0xFFFE` |
//!
//! ## Usage
//!
//! ```rust,ignore
//! pqdaq::dma_buffers!(1000, ".uncached");
//! static CALIBRATION: CalibrationTracker =
//!     CalibrationTracker::new(FactoryCalibration::at_factory_supply(VREFINT_CAL));
//!
//! #[interrupt]
//! fn DMA1_STR0() {
//!     let flags = dma.clear_flags();
//!     pqdaq::acquisition_irq!(flags.half, flags.full, flags.error);
//! }
//!
//! #[interrupt]
//! fn DMA1_STR1() {
//!     pqdaq::transport_irq!();
//! }
//!
//! let mut acq = Acquisition::new(resources, uart, adc, Uncached, mono, AcquisitionConfig::default());
//! acq.arm()?;
//! pqdaq::timer::run_dispatch_loop(&mut acq, &mut delay, 1_000);
//! ```
//!
//! --
//! Designed for `#![no_std]` use on Cortex-M class microcontrollers.

#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results
)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod fmt;

pub use critical_section;

pub mod calibration;
pub mod consts;
pub mod crc;
pub mod dispatch;
mod error;
pub mod frame;
pub mod packet;
pub mod placement;
pub mod ring;
pub mod sample;
pub mod signals;
pub mod timer;
pub mod transport;

pub use error::{Error, Result};
