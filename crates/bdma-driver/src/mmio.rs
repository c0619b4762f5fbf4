//! Memory-mapped register windows
//!
//! Two layers:
//! - [`RegisterIo`]: raw 32-bit access to a window, implemented by the VFIO
//!   [`MappedRegion`] and by the emulated host.
//! - [`RegisterWindow`]: the checked view handed to callers; every access is
//!   validated for alignment and bounds before it reaches the hardware.

// Hardware register access requires exact type casts for mmap/ioctl APIs
// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::items_after_statements)] // VFIO ioctl constants near usage

use crate::error::{BdmaError, Result};
use bdma_chip::bar::Bar;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fmt::Debug;
use std::fs::File;
use std::os::unix::io::{AsFd, AsRawFd};
use std::ptr::NonNull;
use std::sync::Arc;

/// Raw access to a register window.
///
/// Offsets are byte offsets from the window base. Implementations may panic
/// on out-of-bounds offsets; use [`RegisterWindow`] for checked access.
pub trait RegisterIo: Debug + Send + Sync {
    /// Length of the window in bytes
    fn len(&self) -> usize;

    /// Reads a 32-bit register
    fn read_u32(&self, offset: usize) -> u32;

    /// Writes a 32-bit register
    fn write_u32(&self, offset: usize, value: u32);
}

/// Checked 32-bit view of one BAR window.
#[derive(Debug, Clone)]
pub struct RegisterWindow {
    bar: Bar,
    io: Arc<dyn RegisterIo>,
}

impl RegisterWindow {
    /// Wrap a mapped window
    pub fn new(bar: Bar, io: Arc<dyn RegisterIo>) -> Self {
        Self { bar, io }
    }

    /// BAR this window maps
    pub const fn bar(&self) -> Bar {
        self.bar
    }

    /// Window length in bytes
    pub fn len(&self) -> usize {
        self.io.len()
    }

    /// True if the window has zero length
    pub fn is_empty(&self) -> bool {
        self.io.len() == 0
    }

    /// Underlying raw window, for engine register blocks
    pub(crate) fn io(&self) -> &Arc<dyn RegisterIo> {
        &self.io
    }

    fn check(&self, offset: u64) -> Result<usize> {
        if offset & 3 != 0 {
            return Err(BdmaError::protocol(format!(
                "{} offset {offset:#x} is not 32-bit aligned",
                self.bar
            )));
        }
        let offset = usize::try_from(offset)
            .ok()
            .filter(|o| o.checked_add(4).is_some_and(|end| end <= self.io.len()))
            .ok_or_else(|| {
                BdmaError::invalid_argument(format!(
                    "{} offset {offset:#x} outside window of {:#x} bytes",
                    self.bar,
                    self.io.len()
                ))
            })?;
        Ok(offset)
    }

    /// Read the 32-bit register at `offset`
    ///
    /// # Errors
    ///
    /// `Protocol` if `offset` is not 4-byte aligned, `InvalidArgument` if it
    /// lies outside the window.
    pub fn read(&self, offset: u64) -> Result<u32> {
        let offset = self.check(offset)?;
        let value = self.io.read_u32(offset);
        tracing::trace!("{} read  @ {offset:#x} = {value:#010x}", self.bar);
        Ok(value)
    }

    /// Write the 32-bit register at `offset`
    ///
    /// # Errors
    ///
    /// `Protocol` if `offset` is not 4-byte aligned, `InvalidArgument` if it
    /// lies outside the window.
    pub fn write(&self, offset: u64, value: u32) -> Result<()> {
        let offset = self.check(offset)?;
        tracing::trace!("{} write @ {offset:#x} = {value:#010x}", self.bar);
        self.io.write_u32(offset, value);
        Ok(())
    }
}

/// VFIO region info structure
#[repr(C)]
#[derive(Debug, Default)]
pub struct VfioRegionInfo {
    /// Size of this structure (for versioning)
    pub argsz: u32,
    /// Region flags (capabilities, permissions)
    pub flags: u32,
    /// Region index (BAR number)
    pub index: u32,
    /// Offset to extended capabilities
    pub cap_offset: u32,
    /// Size of the region in bytes
    pub size: u64,
    /// Offset from mmap base
    pub offset: u64,
}

/// Query a VFIO region (BAR or config space) of an open device.
///
/// # Errors
///
/// Returns an error if the `VFIO_DEVICE_GET_REGION_INFO` ioctl fails.
pub fn region_info(device_fd: &File, index: u32) -> Result<VfioRegionInfo> {
    let mut info = VfioRegionInfo {
        argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
        index,
        ..Default::default()
    };

    // VFIO_DEVICE_GET_REGION_INFO = _IOWR(';', 100 + 8, ...)
    const VFIO_DEVICE_GET_REGION_INFO: libc::c_ulong = 0x3b6c;

    // SAFETY: VFIO_DEVICE_GET_REGION_INFO ioctl - kernel returns region size/offset.
    // Invariants: (1) device_fd valid from VFIO device open; (2) VfioRegionInfo initialized
    // with argsz = size_of, index set; (3) ioctl reads/writes info; (4) layout matches kernel.
    let ret = unsafe {
        libc::ioctl(
            device_fd.as_raw_fd(),
            VFIO_DEVICE_GET_REGION_INFO as _,
            &raw mut info,
        )
    };

    if ret < 0 {
        return Err(BdmaError::hardware_unavailable(format!(
            "Failed to get region {index} info: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(info)
}

/// Mapped BAR region for MMIO access
pub struct MappedRegion {
    /// Memory-mapped pointer
    ptr: NonNull<u8>,
    /// Size of the mapping
    size: usize,
    /// BAR index
    bar: Bar,
}

impl Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("bar", &self.bar)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapped memory exclusively. Moving between threads
// doesn't invalidate the mapping (mmap'd memory is process-wide). No thread-local state.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - all access is volatile 32-bit loads/stores on device memory; the
// hardware serializes concurrent accesses and the mapping itself is immutable.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map a whole BAR via VFIO
    ///
    /// # Errors
    ///
    /// Returns an error if the region query or the mapping fails.
    pub fn map(device_fd: &File, bar: Bar) -> Result<Self> {
        let info = region_info(device_fd, u32::from(bar.index()))?;
        Self::map_range(device_fd, bar, &info, info.size as usize)
    }

    /// Map the first `len` bytes of a BAR whose region info is already known
    ///
    /// VFIO maps BARs uncached, and device memory is never swapped.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is zero or larger than the region, or if
    /// `mmap` fails.
    pub fn map_range(device_fd: &File, bar: Bar, info: &VfioRegionInfo, len: usize) -> Result<Self> {
        tracing::debug!(
            "{bar}: size={:#x}, offset={:#x}, flags={:#x}",
            info.size,
            info.offset,
            info.flags
        );

        if len == 0 || len as u64 > info.size {
            return Err(BdmaError::invalid_argument(format!(
                "Cannot map {len:#x} bytes of {bar} (size {:#x})",
                info.size
            )));
        }

        // SAFETY: mmap necessary for MMIO - maps BAR region into process address space.
        // Invariants: (1) device_fd valid; (2) info.offset from successful ioctl, len <= size;
        // (3) mapping exclusive via VFIO/IOMMU; (4) ptr valid for len bytes or Err.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                device_fd.as_fd(),
                info.offset,
            )
            .map_err(|e| BdmaError::hardware_unavailable(format!("Failed to mmap {bar}: {e}")))?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| BdmaError::hardware_unavailable(format!("mmap of {bar} returned null")))?;

        tracing::info!("Mapped {bar} at {ptr:p}, size={len:#x}");

        Ok(Self {
            ptr,
            size: len,
            bar,
        })
    }

    /// Get BAR type
    pub const fn bar(&self) -> Bar {
        self.bar
    }

    /// Get region size
    pub const fn size(&self) -> usize {
        self.size
    }
}

impl RegisterIo for MappedRegion {
    fn len(&self) -> usize {
        self.size
    }

    fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change value.
        // Invariants: (1) ptr from mmap, valid for self.size; (2) offset+4 <= size;
        // (3) callers pass 4-byte aligned offsets on a page-aligned base.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side effects.
        // Invariants: (1) ptr from mmap; (2) offset+4 <= size; (3) u32 aligned.
        unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: munmap necessary - ptr/size are exactly what mmap returned in
        // map_range(); Drop runs at most once and no references outlive self.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            tracing::error!("munmap of {} failed during drop: {e}", self.bar);
        }
        tracing::debug!("Unmapped {}", self.bar);
    }
}
