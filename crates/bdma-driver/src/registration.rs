//! Memory registration
//!
//! Turns a user virtual buffer into a pinned, bus-mapped region and loads
//! the engine's physical-address table with it.
//!
//! A [`RegionMapping`] owns the pins and mappings of one region. Dropping it
//! unmaps every page in reverse order and then unpins, so every exit path of
//! [`Engine::register`] (early return, re-registration, engine teardown)
//! releases exactly what was acquired.

use crate::engine::Engine;
use crate::error::{BdmaError, Result};
use crate::host::{BusAddr, DmaHost, PinnedPage};
use bdma_chip::{page_ceil, page_floor, regs, PAGE_SIZE};
use std::sync::Arc;

/// Page-aligned bounds of a registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    head_page: u64,
    tail_page: u64,
}

impl MemoryRegion {
    /// Bounds covering `len` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the buffer wraps the address space.
    pub fn covering(addr: u64, len: u64) -> Result<Self> {
        let end = addr
            .checked_add(len)
            .ok_or_else(|| BdmaError::invalid_argument(format!("buffer {addr:#x}+{len:#x} wraps")))?;
        let tail_page = page_ceil(end)
            .ok_or_else(|| BdmaError::invalid_argument(format!("buffer end {end:#x} wraps")))?;
        Ok(Self {
            head_page: page_floor(addr),
            tail_page,
        })
    }

    /// First byte of the first page
    pub const fn head_page(&self) -> u64 {
        self.head_page
    }

    /// First byte past the last page
    pub const fn tail_page(&self) -> u64 {
        self.tail_page
    }

    /// Byte span
    pub const fn len(&self) -> u64 {
        self.tail_page - self.head_page
    }

    /// True if the region spans no pages
    pub const fn is_empty(&self) -> bool {
        self.tail_page == self.head_page
    }

    /// Page count
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pages(&self) -> usize {
        (self.len() / PAGE_SIZE) as usize
    }

    /// True if `[addr, addr + len)` lies inside the region
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr.checked_add(len)
            .is_some_and(|end| addr >= self.head_page && addr <= self.tail_page && end <= self.tail_page)
    }
}

/// Pins and bus mappings backing one registered region.
#[derive(Debug)]
pub(crate) struct RegionMapping {
    region: MemoryRegion,
    pages: Vec<PinnedPage>,
    bus_addrs: Vec<BusAddr>,
    host: Arc<dyn DmaHost>,
}

impl RegionMapping {
    /// Pin and map every page of `region`.
    ///
    /// On error everything acquired so far has already been released.
    fn build(host: &Arc<dyn DmaHost>, region: MemoryRegion) -> Result<Self> {
        let wanted = region.pages();
        let pages = host.pin_user_pages(region.head_page(), wanted);
        let pinned = pages.len();

        let mut mapping = Self {
            region,
            pages,
            bus_addrs: Vec::with_capacity(wanted),
            host: Arc::clone(host),
        };

        if pinned < wanted {
            return Err(BdmaError::fault(format!(
                "pinned {pinned} of {wanted} pages at {:#x}",
                region.head_page()
            )));
        }

        for (index, page) in mapping.pages.iter().enumerate() {
            let bus = mapping.host.map_page(page).map_err(|e| {
                BdmaError::fault(format!(
                    "mapping page {index} ({:#x}) failed: {e}",
                    page.vaddr()
                ))
            })?;
            mapping.bus_addrs.push(bus);
        }

        Ok(mapping)
    }

    pub(crate) const fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub(crate) fn bus_addrs(&self) -> &[BusAddr] {
        &self.bus_addrs
    }
}

impl Drop for RegionMapping {
    fn drop(&mut self) {
        for bus in self.bus_addrs.drain(..).rev() {
            self.host.unmap_page(bus);
        }
        let pages = std::mem::take(&mut self.pages);
        if !pages.is_empty() {
            tracing::debug!(
                "Releasing {} pinned pages at {:#x}",
                pages.len(),
                self.region.head_page()
            );
            self.host.unpin_user_pages(pages);
        }
    }
}

impl Engine {
    /// Register the buffer `[user_addr, user_addr + user_len)` for DMA.
    ///
    /// The buffer must span more than one page. A previous registration is
    /// replaced, but only once the new one is fully pinned and mapped; on
    /// any error the engine is left exactly as it was.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the buffer is one page or less, or wraps.
    /// - `ResourceExhausted` if it needs more than `MAX_PAGES` pages.
    /// - `Fault` if pinning comes up short or a page cannot be mapped.
    pub fn register(&self, user_addr: u64, user_len: u64) -> Result<MemoryRegion> {
        if user_len <= PAGE_SIZE {
            return Err(BdmaError::invalid_argument(format!(
                "registration of {user_len:#x} bytes must span more than one page"
            )));
        }

        let region = MemoryRegion::covering(user_addr, user_len)?;
        if region.pages() > regs::MAX_PAGES {
            return Err(BdmaError::resource_exhausted(format!(
                "{} pages requested, table holds {} ({:#x} bytes)",
                region.pages(),
                regs::MAX_PAGES,
                regs::MAX_REGION_BYTES
            )));
        }

        let mut current = self.region.lock();
        let mapping = RegionMapping::build(&self.host, region)?;

        let stale = current.as_ref().map_or(0, |m| m.region().pages());
        if stale > region.pages() {
            self.regs.clear_entries(region.pages()..stale);
        }
        for (page, &bus) in mapping.bus_addrs().iter().enumerate() {
            self.regs.write_entry(page, bus);
        }

        let previous = current.replace(mapping);
        drop(previous);

        tracing::debug!(
            "Channel {}: registered {:#x}..{:#x} ({} pages)",
            self.channel(),
            region.head_page(),
            region.tail_page(),
            region.pages()
        );
        Ok(region)
    }

    /// Release the registered region and zero its table entries.
    ///
    /// No-op if nothing is registered.
    pub fn unregister(&self) {
        let mut current = self.region.lock();
        if let Some(mapping) = current.take() {
            self.regs.clear_entries(0..mapping.region().pages());
            drop(mapping);
            tracing::debug!("Channel {}: region released", self.channel());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covering_rounds_outward() {
        let r = MemoryRegion::covering(0x1_0010, 0x2000).unwrap();
        assert_eq!(r.head_page(), 0x1_0000);
        assert_eq!(r.tail_page(), 0x1_3000);
        assert_eq!(r.pages(), 3);
        assert_eq!(r.len(), 0x3000);
    }

    #[test]
    fn covering_rejects_wrap() {
        assert!(MemoryRegion::covering(u64::MAX - 10, 0x2000).is_err());
        assert!(MemoryRegion::covering(u64::MAX - 0x1800, 0x1000).is_err());
    }

    #[test]
    fn contains_bounds() {
        let r = MemoryRegion::covering(0x4000, 0x2000).unwrap();
        assert!(r.contains(0x4000, 8));
        assert!(r.contains(0x5FF8, 8));
        assert!(r.contains(0x6000, 0));
        assert!(!r.contains(0x3FF8, 8));
        assert!(!r.contains(0x5FFC, 8));
        assert!(!r.contains(0x6000, 1));
        assert!(!r.contains(u64::MAX, 2));
    }
}
