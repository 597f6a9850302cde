//! Collaborator interfaces consumed by the dispatch loop.
//!
//! Peripheral setup (clock tree, pins, timer, converters, UART, DMA streams)
//! lives outside this crate. The dispatch loop only needs the narrow
//! contracts below, which a board support layer implements once.

/// A DMA-driven byte-stream sender.
///
/// `send` starts a transmission and returns immediately; completion is
/// reported asynchronously by calling
/// [`AcquisitionSignals::on_transport_complete`](crate::signals::AcquisitionSignals::on_transport_complete)
/// from the transfer-complete interrupt.
///
/// The slice passed to `send` is the dispatch loop's packet buffer. It stays
/// untouched until completion is signalled or [`abort`](Transport::abort) is
/// called, so the implementation may hand its address straight to the DMA
/// engine.
pub trait Transport {
    /// Error raised when a transmission cannot be started.
    type Error;

    /// Starts transmitting `bytes`.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Stops an in-flight transmission. After this returns no completion
    /// interrupt for that transmission may fire.
    fn abort(&mut self);
}

/// The timer-triggered dual-converter acquisition chain.
///
/// Once started it must deliver one packed sample word per period into the
/// next ring slot and raise the half-transfer and transfer-complete
/// interrupts, forwarding them to
/// [`AcquisitionSignals`](crate::signals::AcquisitionSignals).
pub trait AcquisitionControl {
    /// Error raised when the chain cannot be (re)started.
    type Error;

    /// Arms DMA, converters and trigger timer, in that order.
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Stops everything and starts again from a clean state: DMA stream
    /// disabled and flags cleared, converters reset, counter back at the
    /// first slot of half A.
    fn restart(&mut self) -> Result<(), Self::Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        T::send(self, bytes)
    }

    fn abort(&mut self) {
        T::abort(self)
    }
}

impl<A: AcquisitionControl + ?Sized> AcquisitionControl for &mut A {
    type Error = A::Error;

    fn start(&mut self) -> Result<(), Self::Error> {
        A::start(self)
    }

    fn restart(&mut self) -> Result<(), Self::Error> {
        A::restart(self)
    }
}
