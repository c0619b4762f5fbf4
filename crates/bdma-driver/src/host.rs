//! Host facilities the driver needs from the platform
//!
//! Everything a kernel driver would get from the PCI core and the DMA API is
//! reached through two traits:
//!
//! - [`BusFunction`]: one PCIe function (enable, bus mastering, regions,
//!   BAR mapping, DMA mask).
//! - [`DmaHost`]: coherent buffers, user page pinning, per-page bus mapping.
//!
//! [`crate::vfio::VfioFunction`] implements both over VFIO;
//! [`crate::emulated::EmulatedFunction`] is the in-memory hardware mock.

use crate::error::Result;
use crate::mmio::RegisterIo;
use bdma_chip::bar::Bar;
use std::fmt::Debug;
use std::sync::Arc;

/// Device-visible address of host memory (IOVA under VFIO)
pub type BusAddr = u64;

/// A DMA-coherent host buffer.
///
/// Returned by [`DmaHost::alloc_coherent`]; must be handed back to
/// [`DmaHost::free_coherent`] exactly once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "coherent buffers must be freed"]
pub struct CoherentBuffer {
    bus_addr: BusAddr,
    len: usize,
}

impl CoherentBuffer {
    /// Describe a buffer the host just allocated
    pub const fn new(bus_addr: BusAddr, len: usize) -> Self {
        Self { bus_addr, len }
    }

    /// Bus address the device writes to
    pub const fn bus_addr(&self) -> BusAddr {
        self.bus_addr
    }

    /// Length in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length buffer
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One user page held resident by the host.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "pinned pages must be unpinned"]
pub struct PinnedPage {
    vaddr: u64,
}

impl PinnedPage {
    /// Record a page the host just pinned
    pub const fn new(vaddr: u64) -> Self {
        Self { vaddr }
    }

    /// Page-aligned user virtual address
    pub const fn vaddr(&self) -> u64 {
        self.vaddr
    }
}

/// DMA facilities of the host.
pub trait DmaHost: Debug + Send + Sync {
    /// Allocate a zeroed DMA-coherent buffer of `len` bytes
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if memory or bus address space ran out.
    fn alloc_coherent(&self, len: usize) -> Result<CoherentBuffer>;

    /// Free a buffer from [`Self::alloc_coherent`]
    fn free_coherent(&self, buffer: CoherentBuffer);

    /// Pin up to `count` consecutive user pages starting at `head`.
    ///
    /// Stops at the first page that cannot be pinned, so the result may hold
    /// fewer than `count` pages. Pages are returned in address order.
    fn pin_user_pages(&self, head: u64, count: usize) -> Vec<PinnedPage>;

    /// Release pages from [`Self::pin_user_pages`]
    fn unpin_user_pages(&self, pages: Vec<PinnedPage>);

    /// Create a bidirectional bus mapping for one pinned page
    ///
    /// # Errors
    ///
    /// `Fault` if the mapping cannot be created.
    fn map_page(&self, page: &PinnedPage) -> Result<BusAddr>;

    /// Remove a mapping from [`Self::map_page`]
    fn unmap_page(&self, bus_addr: BusAddr);
}

/// One PCIe function as seen by the driver.
///
/// Release operations cannot fail from the caller's point of view; hosts log
/// anomalies instead.
pub trait BusFunction: Debug + Send + Sync {
    /// PCI address (`0000:01:00.0`)
    fn address(&self) -> &str;

    /// Enable the function
    ///
    /// # Errors
    ///
    /// `HardwareUnavailable` if the function cannot be enabled.
    fn enable(&self) -> Result<()>;

    /// Disable the function
    fn disable(&self);

    /// Program the maximum read request size
    ///
    /// # Errors
    ///
    /// Returns an error if the capability is absent or the write fails.
    fn set_max_read_request(&self, bytes: u32) -> Result<()>;

    /// Set or clear bus mastering
    ///
    /// # Errors
    ///
    /// `HardwareUnavailable` if the command register cannot be written.
    fn set_bus_master(&self, enable: bool) -> Result<()>;

    /// Reserve all memory regions of the function for `owner`
    ///
    /// # Errors
    ///
    /// `HardwareUnavailable` if another owner holds them.
    fn request_regions(&self, owner: &str) -> Result<()>;

    /// Release regions from [`Self::request_regions`]
    fn release_regions(&self);

    /// Size of `bar`, or `None` if the function does not implement it
    fn bar_len(&self, bar: Bar) -> Option<u64>;

    /// Map the first `len` bytes of `bar` for uncached register access
    ///
    /// # Errors
    ///
    /// `HardwareUnavailable` if the mapping fails.
    fn map_bar(&self, bar: Bar, len: usize) -> Result<Arc<dyn RegisterIo>>;

    /// Restrict DMA addressing to `bits`
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot address devices that narrowly
    /// or that widely.
    fn set_dma_mask(&self, bits: u32) -> Result<()>;

    /// DMA facilities for this function
    fn dma_host(&self) -> Arc<dyn DmaHost>;
}
