//! Interrupt-shared hand-off state.
//!
//! Every field here is a single scalar with one writer per transition, so no
//! lock is ever taken from interrupt context:
//!
//! | Field | Written by | Cleared / consumed by |
//! |-------|-----------|------------------------|
//! | region state | DMA half / complete ISRs (`ReadyHalf`) | dispatch loop (`Idle`) |
//! | transport busy | dispatch loop (set) | transport-complete ISR (clear) |
//! | acquisition fault | DMA / converter error ISR (set) | dispatch loop (clear) |
//! | counters, generation | DMA ISRs | never |
//!
//! The dispatch loop's read-and-reset of the region state and of the fault
//! flag runs inside a `critical_section`, which on a single core just masks
//! interrupts for two instructions. Targets without compare-and-swap (ARMv6-M)
//! are supported because only atomic `load`/`store` is used.
//!
//! The ISR entry points only perform a few stores. They never allocate,
//! log or loop.

use crate::ring::HalfId;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

const IDLE: u8 = 0;
const READY_A: u8 = 1;
const READY_B: u8 = 2;

/// Which half, if any, is ready for the encoder.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum BufferRegionState {
    /// Nothing to encode.
    #[default]
    Idle,
    /// The given half has been completely written and may be encoded.
    ReadyHalf(HalfId),
}

impl BufferRegionState {
    const fn encode(self) -> u8 {
        match self {
            BufferRegionState::Idle => IDLE,
            BufferRegionState::ReadyHalf(HalfId::A) => READY_A,
            BufferRegionState::ReadyHalf(HalfId::B) => READY_B,
        }
    }

    const fn decode(raw: u8) -> Self {
        match raw {
            READY_A => BufferRegionState::ReadyHalf(HalfId::A),
            READY_B => BufferRegionState::ReadyHalf(HalfId::B),
            _ => BufferRegionState::Idle,
        }
    }
}

/// Flags and counters shared between the interrupt handlers and the
/// dispatch loop.
///
/// Declare one as a `static` and hand a reference to both sides:
///
/// ```rust
/// use pqdaq::signals::AcquisitionSignals;
///
/// static SIGNALS: AcquisitionSignals = AcquisitionSignals::new();
///
/// // DMA half-transfer interrupt
/// SIGNALS.on_half_complete();
/// assert!(SIGNALS.region_state() != pqdaq::signals::BufferRegionState::Idle);
/// ```
#[derive(Debug)]
pub struct AcquisitionSignals {
    region: AtomicU8,
    last_completed: AtomicU8,
    generation: AtomicU32,
    overruns: AtomicU32,
    alternation_faults: AtomicU32,
    transport_busy: AtomicBool,
    acquisition_fault: AtomicBool,
}

impl AcquisitionSignals {
    /// Creates the signal block in its initial state: idle, transport free,
    /// no fault.
    pub const fn new() -> Self {
        Self {
            region: AtomicU8::new(IDLE),
            last_completed: AtomicU8::new(IDLE),
            generation: AtomicU32::new(0),
            overruns: AtomicU32::new(0),
            alternation_faults: AtomicU32::new(0),
            transport_busy: AtomicBool::new(false),
            acquisition_fault: AtomicBool::new(false),
        }
    }

    /// DMA half-transfer interrupt: half A is complete.
    #[inline]
    pub fn on_half_complete(&self) {
        self.publish(HalfId::A);
    }

    /// DMA transfer-complete interrupt: half B is complete.
    #[inline]
    pub fn on_full_complete(&self) {
        self.publish(HalfId::B);
    }

    /// Transport-complete interrupt: the previous packet has left the buffer.
    #[inline]
    pub fn on_transport_complete(&self) {
        self.transport_busy.store(false, Ordering::Release);
    }

    /// Converter overrun or DMA transfer error interrupt.
    #[inline]
    pub fn on_acquisition_error(&self) {
        self.acquisition_fault.store(true, Ordering::Release);
    }

    fn publish(&self, half: HalfId) {
        let ready = BufferRegionState::ReadyHalf(half).encode();
        // Only the DMA interrupts write these counters, and they do not
        // preempt each other, so load/store is enough.
        if self.region.load(Ordering::Acquire) != IDLE {
            bump(&self.overruns);
        }
        if self.last_completed.load(Ordering::Relaxed) == ready {
            bump(&self.alternation_faults);
        }
        self.last_completed.store(ready, Ordering::Relaxed);
        bump(&self.generation);
        self.region.store(ready, Ordering::Release);
    }

    /// Current hand-off state, without consuming it.
    pub fn region_state(&self) -> BufferRegionState {
        BufferRegionState::decode(self.region.load(Ordering::Acquire))
    }

    /// Consumes a ready half, resetting the state to `Idle`.
    ///
    /// Returns the half together with the completion generation it was
    /// published at, or `None` when nothing is ready.
    pub fn take_ready(&self) -> Option<(HalfId, u32)> {
        critical_section::with(|_| {
            match BufferRegionState::decode(self.region.load(Ordering::Acquire)) {
                BufferRegionState::Idle => None,
                BufferRegionState::ReadyHalf(half) => {
                    self.region.store(IDLE, Ordering::Relaxed);
                    Some((half, self.generation.load(Ordering::Relaxed)))
                }
            }
        })
    }

    /// Number of half completions since start.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Halves superseded before the dispatch loop consumed them.
    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Completion events that repeated the previous half instead of
    /// alternating.
    pub fn alternation_faults(&self) -> u32 {
        self.alternation_faults.load(Ordering::Relaxed)
    }

    /// Whether a transmission is still in flight.
    pub fn transport_busy(&self) -> bool {
        self.transport_busy.load(Ordering::Acquire)
    }

    /// Marks the transport busy. Called by the dispatch loop before it starts
    /// a transmission, so an immediate completion cannot be lost.
    pub(crate) fn mark_transport_busy(&self) {
        self.transport_busy.store(true, Ordering::Release);
    }

    /// Clears the busy flag from the loop side. Only valid once the
    /// transmission has been aborted or failed to start, so that no
    /// completion interrupt can race with it.
    pub(crate) fn release_transport(&self) {
        self.transport_busy.store(false, Ordering::Release);
    }

    /// Consumes a pending acquisition fault.
    pub fn take_fault(&self) -> bool {
        critical_section::with(|_| {
            let fault = self.acquisition_fault.load(Ordering::Acquire);
            if fault {
                self.acquisition_fault.store(false, Ordering::Relaxed);
            }
            fault
        })
    }

    /// Forgets any half published before an acquisition restart.
    pub(crate) fn reset_acquisition(&self) {
        critical_section::with(|_| {
            self.region.store(IDLE, Ordering::Relaxed);
            self.last_completed.store(IDLE, Ordering::Relaxed);
        });
    }
}

impl Default for AcquisitionSignals {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU32) {
    counter.store(counter.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
}
