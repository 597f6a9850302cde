/// Declares the acquisition ring, the packet buffer and the signal block as
/// statics.
///
/// The ring and packet buffer are the only memory touched by a DMA engine.
/// Pass a linker section name to place them in non-cacheable memory; the
/// section must be `NOLOAD` (both buffers are fully overwritten before
/// first use) and covered by an MPU region configured as non-cacheable.
///
/// # Arguments
/// - `$samples`: samples per half-buffer (`S`)
/// - `$section` (optional): linker section, e.g. `".uncached"`
///
/// Expands to three statics: `ACQ_RING`, `ACQ_PACKET` and `ACQ_SIGNALS`.
///
/// # Example
/// ```rust
/// pqdaq::dma_buffers!(1000);
///
/// assert_eq!(ACQ_RING.dma_target().words, 2000);
/// assert_eq!(pqdaq::packet::PacketBuffer::<{ pqdaq::consts::packet_len(1000) }>::LEN, 4012);
/// ```
///
/// ```rust,ignore
/// // memory.x: .uncached (NOLOAD) : ALIGN(32) { *(.uncached .uncached.*) } > RAM_D2
/// pqdaq::dma_buffers!(1000, ".uncached");
/// ```
#[macro_export]
macro_rules! dma_buffers {
    ( $samples:expr ) => {
        /// Acquisition ring written by the converter DMA stream.
        pub static ACQ_RING: $crate::ring::AcquisitionRing<{ $samples }> =
            $crate::ring::AcquisitionRing::new();
        /// Outgoing packet read by the transport DMA stream.
        pub static ACQ_PACKET: $crate::packet::PacketBuffer<{ $crate::consts::packet_len($samples) }> =
            $crate::packet::PacketBuffer::new();
        /// Hand-off flags shared with the interrupt handlers.
        pub static ACQ_SIGNALS: $crate::signals::AcquisitionSignals =
            $crate::signals::AcquisitionSignals::new();
    };
    ( $samples:expr, $section:literal ) => {
        /// Acquisition ring written by the converter DMA stream.
        #[unsafe(link_section = $section)]
        pub static ACQ_RING: $crate::ring::AcquisitionRing<{ $samples }> =
            $crate::ring::AcquisitionRing::new();
        /// Outgoing packet read by the transport DMA stream.
        #[unsafe(link_section = $section)]
        pub static ACQ_PACKET: $crate::packet::PacketBuffer<{ $crate::consts::packet_len($samples) }> =
            $crate::packet::PacketBuffer::new();
        /// Hand-off flags shared with the interrupt handlers.
        pub static ACQ_SIGNALS: $crate::signals::AcquisitionSignals =
            $crate::signals::AcquisitionSignals::new();
    };
}

/// Forwards the DMA half-transfer / transfer-complete interrupt to
/// `ACQ_SIGNALS`.
///
/// # Arguments
/// - `half`: the half-transfer flag was set
/// - `full`: the transfer-complete flag was set
/// - `error`: the transfer-error flag was set
///
/// Both completion flags can be pending at once if the handler was delayed by
/// a whole half period; they are forwarded in ring order.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn DMA1_STR0() {
///     let flags = dma.clear_flags();
///     acquisition_irq!(flags.half, flags.full, flags.error);
/// }
/// ```
///
/// # Notes
/// - This macro assumes `ACQ_SIGNALS` was declared with `dma_buffers!`.
#[macro_export]
macro_rules! acquisition_irq {
    ( $half:expr, $full:expr, $error:expr ) => {{
        if $error {
            ACQ_SIGNALS.on_acquisition_error();
        }
        if $half {
            ACQ_SIGNALS.on_half_complete();
        }
        if $full {
            ACQ_SIGNALS.on_full_complete();
        }
    }};
}

/// Forwards the transport DMA transfer-complete interrupt to `ACQ_SIGNALS`.
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn DMA1_STR1() {
///     transport_irq!();
/// }
/// ```
///
/// # Notes
/// - This macro assumes `ACQ_SIGNALS` was declared with `dma_buffers!`.
#[macro_export]
macro_rules! transport_irq {
    () => {
        ACQ_SIGNALS.on_transport_complete();
    };
}

/// Declares a static global `VREFINT` slot for the reference-channel
/// converter, protected by a `critical_section` mutex.
///
/// The slot starts empty; fill it once from `main` with
/// `setup_reference_source!`.
///
/// # Arguments
/// - `$source`: The concrete type of the reference converter (must implement
///   [`ReferenceSource`](crate::calibration::ReferenceSource))
///
/// # Example
/// ```rust,ignore
/// init_reference_source!(Vrefint<ADC3>);
/// ```
#[macro_export]
macro_rules! init_reference_source {
    ( $source:ty ) => {
        /// Reference-channel converter owned by the calibration interrupt.
        pub static VREFINT: $crate::critical_section::Mutex<
            ::core::cell::RefCell<Option<$source>>,
        > = $crate::timer::global_reference_init::<$source>();
    };
}

/// Moves a configured reference converter into the global `VREFINT` slot.
///
/// # Arguments
/// - `$source`: The reference converter instance
///
/// # Example
/// ```rust,ignore
/// fn main() {
///     let vrefint = Vrefint::new(adc3);
///     setup_reference_source!(vrefint);
/// }
/// ```
///
/// # Notes
/// - Requires `init_reference_source!` to have been used earlier.
#[macro_export]
macro_rules! setup_reference_source {
    ( $source:expr ) => {
        $crate::timer::global_reference_setup(&VREFINT, $source)
    };
}

/// Runs one calibration step against the global `VREFINT` slot.
///
/// Evaluates to the new supply voltage when a measurement was accepted.
///
/// # Arguments
/// - `$tracker`: A `&CalibrationTracker`
/// - `$now_ms`: The current time in milliseconds
///
/// # Example
/// ```rust,ignore
/// #[interrupt]
/// fn TIM7() {
///     calibration_tick!(&CALIBRATION, MONO.now_ms());
/// }
/// ```
///
/// # Notes
/// - Requires `init_reference_source!` to have been used earlier.
#[macro_export]
macro_rules! calibration_tick {
    ( $tracker:expr, $now_ms:expr ) => {
        $crate::timer::global_calibration_tick(&VREFINT, $tracker, $now_ms)
    };
}
