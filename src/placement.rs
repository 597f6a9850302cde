//! Memory placement and cache coherence policy for DMA-visible buffers.
//!
//! On a core with a data cache the CPU and the DMA engine can disagree about
//! the contents of a buffer. There are two ways to stay coherent:
//!
//! - **Uncached placement** (default): put the acquisition ring and the packet
//!   buffer in a memory region the MPU marks non-cacheable. No maintenance is
//!   ever needed. See [`dma_buffers!`](crate::dma_buffers) for declaring the
//!   buffers in a dedicated linker section.
//! - **Manual maintenance**: if only cacheable memory is available, the CPU
//!   must *invalidate* a DMA-written region before reading it and *clean* a
//!   CPU-written region before a DMA engine reads it.
//!
//! The dispatch loop is written against [`CoherencePolicy`] and never knows
//! which of the two is in force. The policy is chosen once, at startup, by
//! the platform code.

/// Cache maintenance hooks invoked around every DMA hand-off.
pub trait CoherencePolicy {
    /// Whether this policy touches the cache at all.
    const MAINTAINS_CACHE: bool;

    /// Called before the CPU reads `region`, which a DMA engine just wrote.
    fn prepare_cpu_read(&mut self, region: &[u8]);

    /// Called after the CPU wrote `region` and before a DMA engine reads it.
    fn prepare_dma_read(&mut self, region: &[u8]);
}

/// Both buffers live in non-cacheable memory: every hook is a no-op.
#[derive(PartialEq, Eq, Clone, Copy, Default, Debug)]
pub struct Uncached;

impl CoherencePolicy for Uncached {
    const MAINTAINS_CACHE: bool = false;

    #[inline(always)]
    fn prepare_cpu_read(&mut self, _region: &[u8]) {}

    #[inline(always)]
    fn prepare_dma_read(&mut self, _region: &[u8]) {}
}

/// Address-range data cache operations, implemented once per target.
///
/// On Cortex-M7 these map directly onto `SCB::invalidate_dcache_by_address`
/// and `SCB::clean_dcache_by_address`. Both receive a range already aligned
/// to [`LINE_SIZE`](CacheMaintenance::LINE_SIZE).
pub trait CacheMaintenance {
    /// Cache line size in bytes. Must be a power of two.
    const LINE_SIZE: usize = 32;

    /// Discards cached copies of `len` bytes at `address`.
    fn invalidate(&mut self, address: usize, len: usize);

    /// Writes back dirty cached copies of `len` bytes at `address`.
    fn clean(&mut self, address: usize, len: usize);
}

/// Buffers live in cacheable memory; maintenance is issued explicitly.
///
/// Ranges are widened to whole cache lines. Invalidating a partially covered
/// line would discard unrelated CPU writes, so buffers used with this policy
/// should be line aligned and padded to a multiple of the line size.
#[derive(Debug)]
pub struct Maintained<M: CacheMaintenance> {
    cache: M,
}

impl<M: CacheMaintenance> Maintained<M> {
    /// Wraps the platform's cache operations.
    pub fn new(cache: M) -> Self {
        Self { cache }
    }

    /// Releases the platform's cache operations.
    pub fn free(self) -> M {
        self.cache
    }

    /// Expands `region` to the enclosing cache-line aligned range.
    pub fn line_range(region: &[u8]) -> (usize, usize) {
        let line = M::LINE_SIZE;
        let start = region.as_ptr() as usize & !(line - 1);
        let end = (region.as_ptr() as usize + region.len() + line - 1) & !(line - 1);
        (start, end - start)
    }
}

impl<M: CacheMaintenance> CoherencePolicy for Maintained<M> {
    const MAINTAINS_CACHE: bool = true;

    fn prepare_cpu_read(&mut self, region: &[u8]) {
        if region.is_empty() {
            return;
        }
        let (address, len) = Self::line_range(region);
        self.cache.invalidate(address, len);
    }

    fn prepare_dma_read(&mut self, region: &[u8]) {
        if region.is_empty() {
            return;
        }
        let (address, len) = Self::line_range(region);
        self.cache.clean(address, len);
    }
}
