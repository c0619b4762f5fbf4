//! VFIO host: real hardware through Linux VFIO
//!
//! [`VfioFunction`] implements [`BusFunction`] for a function bound to
//! `vfio-pci`; [`VfioDma`] implements [`DmaHost`] on its IOMMU container.
//!
//! # Requirements
//!
//! 1. IOMMU enabled in BIOS and kernel (`intel_iommu=on` or `amd_iommu=on`)
//! 2. Device unbound from native driver and bound to `vfio-pci`
//! 3. User in `vfio` group or root permissions, and a memlock limit large
//!    enough for registered buffers
//!
//! # Setup Commands
//!
//! ```bash
//! bdma bind-vfio 0000:01:00.0
//! sudo chown $USER /dev/vfio/$(bdma iommu-group 0000:01:00.0)
//! ```
//!
//! # Mapping of bus operations
//!
//! | Operation | VFIO |
//! |-----------|------|
//! | enable / disable | command register memory-space bit, via config region |
//! | bus master | command register bit 2 |
//! | max read request | PCIe capability device control, bits 14:12 |
//! | request regions | exclusive per-function claim (the device fd is exclusive already) |
//! | map BAR | `VFIO_DEVICE_GET_REGION_INFO` + `mmap` |
//! | DMA mask | bounds the IOVA allocator |
//! | coherent buffer | `alloc_zeroed` + `mlock` + `VFIO_IOMMU_MAP_DMA` |
//! | pin user pages | per-page `mlock` |
//! | map page | one-page `VFIO_IOMMU_MAP_DMA` |

// FFI/ioctl casts are intentional - VFIO API requires specific types
#![allow(clippy::cast_possible_truncation)]

use crate::error::{BdmaError, Result};
use crate::host::{BusAddr, BusFunction, CoherentBuffer, DmaHost, PinnedPage};
use crate::mmio::{region_info, MappedRegion, RegisterIo};
use bdma_chip::bar::Bar;
use bdma_chip::PAGE_SIZE;
use parking_lot::Mutex;
use rustix::mm::{mlock, munlock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;
use std::sync::Arc;

/// VFIO ioctl numbers (from Linux kernel headers)
///
/// These are calculated as: _IO(';', base + offset)
/// where _IO is: ((type as u64) << 8) | nr
mod ioctls {
    use std::os::raw::c_ulong;

    /// Helper to create ioctl number: _IO(type, nr) = (type << 8) | nr
    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    pub const VFIO_TYPE: u8 = b';';
    pub const VFIO_BASE: u8 = 100;

    // VFIO container ioctls
    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);

    // VFIO group ioctls
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);

    // IOMMU DMA mapping
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    // API version
    pub const VFIO_API_VERSION: i32 = 0;

    // IOMMU types
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;

    // Group status flags
    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

    // DMA map flags
    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;

    /// Region index of PCI config space
    pub const VFIO_PCI_CONFIG_REGION_INDEX: u32 = 7;
}

/// PCI configuration space layout used by the driver
mod config {
    pub const COMMAND: u64 = 0x04;
    pub const STATUS: u64 = 0x06;
    pub const CAPABILITIES_POINTER: u64 = 0x34;

    pub const COMMAND_MEMORY: u16 = 1 << 1;
    pub const COMMAND_MASTER: u16 = 1 << 2;
    pub const STATUS_CAP_LIST: u16 = 1 << 4;

    pub const CAP_ID_EXP: u8 = 0x10;
    pub const EXP_DEVCTL: u64 = 0x08;
    pub const DEVCTL_READRQ: u16 = 0x7 << 12;
}

/// VFIO group status structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

/// VFIO DMA map structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

/// VFIO DMA unmap structure
#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// First IOVA handed out (256 MiB)
const IOVA_BASE: u64 = 0x1000_0000;

/// Encode a max read request size for the device control register.
///
/// Valid sizes are powers of two from 128 to 4096 bytes.
///
/// # Errors
///
/// `InvalidArgument` for any other size.
pub fn encode_max_read_request(bytes: u32) -> Result<u16> {
    if !bytes.is_power_of_two() || !(128..=4096).contains(&bytes) {
        return Err(BdmaError::invalid_argument(format!(
            "max read request {bytes} is not a power of two in 128..=4096"
        )));
    }
    Ok(((bytes.trailing_zeros() - 7) as u16) << 12)
}

/// A function bound to `vfio-pci`.
#[derive(Debug)]
pub struct VfioFunction {
    /// PCIe address
    address: String,
    /// VFIO group file descriptor (kept open for lifetime)
    _group: File,
    /// VFIO device file descriptor
    device: File,
    /// Offset of config space within the device fd
    config_offset: u64,
    /// Owner holding the regions, if any
    regions: Mutex<Option<String>>,
    /// DMA side, shares the container
    dma: Arc<VfioDma>,
}

impl VfioFunction {
    /// Open the VFIO container, group and device for `pcie_address`.
    ///
    /// # Errors
    ///
    /// `HardwareUnavailable` if VFIO is unusable or the device is not bound
    /// to `vfio-pci`.
    pub fn open(pcie_address: &str) -> Result<Self> {
        tracing::info!("Opening VFIO function {pcie_address}");

        let iommu_group = iommu_group(pcie_address)?;
        tracing::debug!("IOMMU group: {iommu_group}");

        // Open VFIO container
        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")
            .map_err(|e| BdmaError::hardware_unavailable(format!("Cannot open /dev/vfio/vfio: {e}")))?;

        // SAFETY: VFIO_GET_API_VERSION ioctl necessary - queries kernel VFIO API version.
        // Invariants: (1) container fd valid from open; (2) _IO(no arg) returns int; (3) kernel
        // returns API version or -errno. Caller guarantees: container is /dev/vfio/vfio.
        let api_version =
            unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };

        if api_version != ioctls::VFIO_API_VERSION {
            return Err(BdmaError::hardware_unavailable(format!(
                "Unsupported VFIO API version: {api_version}"
            )));
        }

        // SAFETY: VFIO_CHECK_EXTENSION ioctl necessary - queries kernel for Type1v2 IOMMU.
        // Invariants: (1) container fd valid; (2) third arg is extension id (VFIO_TYPE1V2_IOMMU);
        // (3) kernel returns 1 if supported, 0 otherwise. Caller guarantees: container open.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };

        if has_type1 != 1 {
            return Err(BdmaError::hardware_unavailable(
                "VFIO Type1v2 IOMMU not supported",
            ));
        }

        // Open IOMMU group
        let group_path = format!("/dev/vfio/{iommu_group}");
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&group_path)
            .map_err(|e| BdmaError::hardware_unavailable(format!("Cannot open {group_path}: {e}")))?;

        // Check group is viable
        let mut group_status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };

        // SAFETY: VFIO_GROUP_GET_STATUS ioctl necessary - kernel fills group_status.
        // Invariants: (1) group fd valid from open; (2) _IOWR reads/writes group_status;
        // (3) layout matches kernel. Caller guarantees: group is /dev/vfio/N.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &raw mut group_status,
            )
        };

        if ret < 0 || (group_status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE) == 0 {
            return Err(BdmaError::hardware_unavailable(
                "VFIO group not viable (all devices must be bound to vfio-pci)",
            ));
        }

        // SAFETY: VFIO_GROUP_SET_CONTAINER ioctl necessary - attaches group to container.
        // Invariants: (1) group fd valid; (2) third arg is ptr to container fd; (3) kernel
        // reads fd. Caller guarantees: group viable, container open.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                std::ptr::from_ref(&container.as_raw_fd()),
            )
        };

        if ret < 0 {
            return Err(BdmaError::hardware_unavailable(format!(
                "Failed to set container: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: VFIO_SET_IOMMU ioctl necessary - enables Type1v2 IOMMU in container.
        // Invariants: (1) container fd valid; (2) third arg is IOMMU type; (3) kernel enables.
        // Caller guarantees: group set, Type1v2 supported.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };

        if ret < 0 {
            return Err(BdmaError::hardware_unavailable(format!(
                "Failed to set IOMMU: {}",
                std::io::Error::last_os_error()
            )));
        }

        // Get device fd
        let pcie_address_cstr = std::ffi::CString::new(pcie_address).map_err(|e| {
            BdmaError::invalid_argument(format!("Invalid PCIe address: {e}"))
        })?;

        // SAFETY: VFIO_GROUP_GET_DEVICE_FD ioctl necessary - opens device fd by PCIe address.
        // Invariants: (1) group fd valid; (2) pcie_address_cstr null-terminated; (3) kernel
        // reads string, returns device fd or -1. Caller guarantees: device in group.
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                pcie_address_cstr.as_ptr(),
            )
        };

        if device_fd < 0 {
            return Err(BdmaError::hardware_unavailable(format!(
                "Failed to get device fd: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: from_raw_fd necessary - device_fd from VFIO ioctl, ownership transferred.
        // Invariants: (1) device_fd is valid open fd; (2) we take ownership, File will close it.
        // Caller guarantees: device_fd >= 0 (checked above).
        let device = unsafe { File::from_raw_fd(device_fd) };

        let config_offset = region_info(&device, ioctls::VFIO_PCI_CONFIG_REGION_INDEX)?.offset;

        tracing::info!("VFIO function {pcie_address} ready (group {iommu_group})");

        Ok(Self {
            address: pcie_address.to_string(),
            _group: group,
            device,
            config_offset,
            regions: Mutex::new(None),
            dma: Arc::new(VfioDma::new(container)),
        })
    }

    fn config_read16(&self, reg: u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.device.read_exact_at(&mut buf, self.config_offset + reg)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn config_read8(&self, reg: u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.device.read_exact_at(&mut buf, self.config_offset + reg)?;
        Ok(buf[0])
    }

    fn config_write16(&self, reg: u64, value: u16) -> Result<()> {
        self.device
            .write_all_at(&value.to_le_bytes(), self.config_offset + reg)?;
        Ok(())
    }

    fn update_command(&self, bits: u16, set: bool) -> Result<()> {
        let command = self.config_read16(config::COMMAND)?;
        let updated = if set { command | bits } else { command & !bits };
        if updated != command {
            self.config_write16(config::COMMAND, updated)?;
        }
        tracing::debug!("{}: command {command:#06x} -> {updated:#06x}", self.address);
        Ok(())
    }

    /// Offset of the PCI Express capability in config space
    fn find_express_capability(&self) -> Result<Option<u64>> {
        if self.config_read16(config::STATUS)? & config::STATUS_CAP_LIST == 0 {
            return Ok(None);
        }
        let mut pos = self.config_read8(config::CAPABILITIES_POINTER)? & !3;
        // The list lives in the first 256 bytes; 48 hops bounds a looped list.
        for _ in 0..48 {
            if pos < 0x40 {
                return Ok(None);
            }
            let id = self.config_read8(u64::from(pos))?;
            if id == config::CAP_ID_EXP {
                return Ok(Some(u64::from(pos)));
            }
            pos = self.config_read8(u64::from(pos) + 1)? & !3;
        }
        Ok(None)
    }
}

impl BusFunction for VfioFunction {
    fn address(&self) -> &str {
        &self.address
    }

    fn enable(&self) -> Result<()> {
        self.update_command(config::COMMAND_MEMORY, true)
            .map_err(|e| BdmaError::hardware_unavailable(format!("{}: enable failed: {e}", self.address)))
    }

    fn disable(&self) {
        if let Err(e) = self.update_command(config::COMMAND_MEMORY, false) {
            tracing::error!("{}: disable failed: {e}", self.address);
        }
    }

    fn set_max_read_request(&self, bytes: u32) -> Result<()> {
        let encoded = encode_max_read_request(bytes)?;
        let cap = self.find_express_capability()?.ok_or_else(|| {
            BdmaError::hardware_unavailable(format!("{}: no PCI Express capability", self.address))
        })?;
        let reg = cap + config::EXP_DEVCTL;
        let devctl = self.config_read16(reg)?;
        let updated = (devctl & !config::DEVCTL_READRQ) | encoded;
        self.config_write16(reg, updated)?;
        tracing::debug!("{}: max read request {bytes} (devctl {updated:#06x})", self.address);
        Ok(())
    }

    fn set_bus_master(&self, enable: bool) -> Result<()> {
        self.update_command(config::COMMAND_MASTER, enable).map_err(|e| {
            BdmaError::hardware_unavailable(format!("{}: bus master update failed: {e}", self.address))
        })
    }

    fn request_regions(&self, owner: &str) -> Result<()> {
        let mut regions = self.regions.lock();
        if let Some(holder) = regions.as_deref() {
            return Err(BdmaError::hardware_unavailable(format!(
                "{}: regions already held by {holder}",
                self.address
            )));
        }
        *regions = Some(owner.to_string());
        Ok(())
    }

    fn release_regions(&self) {
        self.regions.lock().take();
    }

    fn bar_len(&self, bar: Bar) -> Option<u64> {
        region_info(&self.device, u32::from(bar.index()))
            .ok()
            .map(|info| info.size)
            .filter(|&size| size > 0)
    }

    fn map_bar(&self, bar: Bar, len: usize) -> Result<Arc<dyn RegisterIo>> {
        let info = region_info(&self.device, u32::from(bar.index()))?;
        Ok(Arc::new(MappedRegion::map_range(&self.device, bar, &info, len)?))
    }

    fn set_dma_mask(&self, bits: u32) -> Result<()> {
        self.dma.set_mask(bits)
    }

    fn dma_host(&self) -> Arc<dyn DmaHost> {
        Arc::clone(&self.dma) as Arc<dyn DmaHost>
    }
}

#[derive(Debug)]
struct CoherentAlloc {
    vaddr: usize,
    layout: std::alloc::Layout,
}

#[derive(Debug)]
struct IovaSpace {
    next: u64,
    limit: u64,
    free_pages: Vec<u64>,
}

impl IovaSpace {
    fn alloc(&mut self, size: u64) -> Option<u64> {
        if size == PAGE_SIZE {
            if let Some(iova) = self.free_pages.pop() {
                return Some(iova);
            }
        }
        let iova = self.next;
        let end = iova.checked_add(size)?;
        if end - 1 > self.limit {
            return None;
        }
        self.next = end;
        Some(iova)
    }

    fn free(&mut self, iova: u64, size: u64) {
        if size == PAGE_SIZE {
            self.free_pages.push(iova);
        }
    }
}

/// DMA side of a VFIO function: one IOMMU container.
#[derive(Debug)]
pub struct VfioDma {
    container: File,
    iova: Mutex<IovaSpace>,
    coherent: Mutex<HashMap<u64, CoherentAlloc>>,
    /// mlock is not counted; user pages stay locked until their last pin goes
    locked: Mutex<HashMap<u64, usize>>,
}

impl VfioDma {
    fn new(container: File) -> Self {
        Self {
            container,
            iova: Mutex::new(IovaSpace {
                next: IOVA_BASE,
                limit: u64::MAX,
                free_pages: Vec::new(),
            }),
            coherent: Mutex::new(HashMap::new()),
            locked: Mutex::new(HashMap::new()),
        }
    }

    fn set_mask(&self, bits: u32) -> Result<()> {
        let limit = match bits {
            64 => u64::MAX,
            32 => u64::from(u32::MAX),
            other => {
                return Err(BdmaError::invalid_argument(format!("unsupported DMA mask {other}")));
            }
        };
        let mut iova = self.iova.lock();
        if iova.next - 1 > limit {
            return Err(BdmaError::hardware_unavailable(format!(
                "IOVA {:#x} already beyond {bits}-bit mask",
                iova.next
            )));
        }
        iova.limit = limit;
        tracing::debug!("DMA mask {bits} bits");
        Ok(())
    }

    fn map_dma(&self, vaddr: u64, iova: u64, size: u64) -> std::io::Result<()> {
        let dma_map = VfioDmaMap {
            argsz: std::mem::size_of::<VfioDmaMap>() as u32,
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr,
            iova,
            size,
        };

        // SAFETY: VFIO_IOMMU_MAP_DMA ioctl necessary for DMA - kernel maps user buffer to IOVA.
        // Invariants: (1) container fd valid from VFIO container open; (2) dma_map has argsz,
        // vaddr/iova/size of caller-locked memory; (3) _IOW ioctl reads dma_map; (4) layout
        // matches kernel. The kernel validates vaddr and fails with EFAULT if unmapped.
        let ret = unsafe {
            libc::ioctl(
                self.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_MAP_DMA as _,
                &raw const dma_map,
            )
        };

        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn unmap_dma(&self, iova: u64, size: u64) {
        let dma_unmap = VfioDmaUnmap {
            argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
            flags: 0,
            iova,
            size,
        };

        // SAFETY: VFIO_IOMMU_UNMAP_DMA ioctl necessary - kernel unmaps IOVA.
        // Invariants: (1) container fd valid; (2) dma_unmap has iova/size from a prior map;
        // (3) layout matches kernel VfioDmaUnmap.
        let ret = unsafe {
            libc::ioctl(
                self.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_UNMAP_DMA as _,
                &raw const dma_unmap,
            )
        };
        if ret < 0 {
            tracing::error!(
                "DMA unmap of iova {iova:#x} failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

impl DmaHost for VfioDma {
    fn alloc_coherent(&self, len: usize) -> Result<CoherentBuffer> {
        let size = len.max(1).div_ceil(PAGE_SIZE as usize) * PAGE_SIZE as usize;
        let layout = std::alloc::Layout::from_size_align(size, PAGE_SIZE as usize)
            .map_err(|e| BdmaError::resource_exhausted(format!("Invalid DMA buffer layout: {e}")))?;

        let iova = self
            .iova
            .lock()
            .alloc(size as u64)
            .ok_or_else(|| BdmaError::resource_exhausted("IOVA space exhausted"))?;

        // SAFETY: Raw alloc_zeroed necessary for page-aligned DMA buffer. Invariants:
        // (1) Layout from from_size_align, size>0, align 4096 power-of-two; (2) returns valid
        // ptr for layout.size() bytes or null on OOM; (3) dealloc in free_coherent with same layout.
        let vaddr = unsafe { std::alloc::alloc_zeroed(layout) };

        if vaddr.is_null() {
            self.iova.lock().free(iova, size as u64);
            return Err(BdmaError::resource_exhausted("Failed to allocate DMA buffer"));
        }

        // SAFETY: mlock necessary for VFIO DMA (prevents swap, ensures physical pages).
        // Invariants: (1) vaddr from alloc_zeroed, valid for size bytes; (2) size matches
        // layout.size(); (3) region [vaddr, vaddr+size) entirely within allocation.
        if let Err(e) = unsafe { mlock(vaddr.cast(), size) } {
            // SAFETY: vaddr allocated above with layout; cleanup on error path before return.
            unsafe { std::alloc::dealloc(vaddr, layout) };
            self.iova.lock().free(iova, size as u64);
            return Err(BdmaError::resource_exhausted(format!(
                "Failed to lock DMA memory: {e}"
            )));
        }

        if let Err(e) = self.map_dma(vaddr as u64, iova, size as u64) {
            tracing::warn!("DMA map failed: {e}");
            // SAFETY: vaddr was allocated above with this exact layout and mlock'd
            // successfully, so munlock and dealloc are valid cleanup operations
            unsafe {
                let _ = munlock(vaddr.cast(), size);
                std::alloc::dealloc(vaddr, layout);
            };
            self.iova.lock().free(iova, size as u64);
            return Err(BdmaError::resource_exhausted(format!("Failed to map DMA: {e}")));
        }

        tracing::debug!("Coherent buffer: vaddr={vaddr:p}, iova={iova:#x}, size={size:#x}");
        self.coherent.lock().insert(
            iova,
            CoherentAlloc {
                vaddr: vaddr as usize,
                layout,
            },
        );
        Ok(CoherentBuffer::new(iova, len))
    }

    fn free_coherent(&self, buffer: CoherentBuffer) {
        let iova = buffer.bus_addr();
        let Some(alloc) = self.coherent.lock().remove(&iova) else {
            tracing::error!("free of unknown coherent buffer at iova {iova:#x}");
            return;
        };
        let size = alloc.layout.size();
        self.unmap_dma(iova, size as u64);

        let vaddr = alloc.vaddr as *mut u8;
        // SAFETY: munlock and dealloc necessary; vaddr/layout recorded by alloc_coherent,
        // the IOMMU mapping was removed above and no other reference to the memory exists.
        unsafe {
            let _ = munlock(vaddr.cast(), size);
            std::alloc::dealloc(vaddr, alloc.layout);
        }
        self.iova.lock().free(iova, size as u64);
        tracing::debug!("Freed coherent buffer at iova={iova:#x}");
    }

    fn pin_user_pages(&self, head: u64, count: usize) -> Vec<PinnedPage> {
        let mut locked = self.locked.lock();
        let mut pages = Vec::with_capacity(count);
        for i in 0..count as u64 {
            let vaddr = head + i * PAGE_SIZE;
            if let Some(refs) = locked.get_mut(&vaddr) {
                *refs += 1;
                pages.push(PinnedPage::new(vaddr));
                continue;
            }
            // SAFETY: mlock only changes residency of the range; the kernel rejects
            // addresses that are not mapped in this process with ENOMEM and never
            // dereferences them on our behalf.
            match unsafe { mlock(vaddr as usize as *mut std::ffi::c_void, PAGE_SIZE as usize) } {
                Ok(()) => {
                    locked.insert(vaddr, 1);
                    pages.push(PinnedPage::new(vaddr));
                }
                Err(e) => {
                    tracing::debug!("Pinning stopped at {vaddr:#x}: {e}");
                    break;
                }
            }
        }
        pages
    }

    fn unpin_user_pages(&self, pages: Vec<PinnedPage>) {
        let mut locked = self.locked.lock();
        for page in pages {
            let vaddr = page.vaddr();
            match locked.get_mut(&vaddr) {
                Some(refs) if *refs > 1 => *refs -= 1,
                Some(_) => {
                    locked.remove(&vaddr);
                    // SAFETY: the page was locked by pin_user_pages and this was its
                    // last pin; munlock only changes residency.
                    if let Err(e) =
                        unsafe { munlock(vaddr as usize as *mut std::ffi::c_void, PAGE_SIZE as usize) }
                    {
                        tracing::error!("munlock of {vaddr:#x} failed: {e}");
                    }
                }
                None => tracing::error!("unpin of page {vaddr:#x} that is not pinned"),
            }
        }
    }

    fn map_page(&self, page: &PinnedPage) -> Result<BusAddr> {
        let iova = self
            .iova
            .lock()
            .alloc(PAGE_SIZE)
            .ok_or_else(|| BdmaError::fault("IOVA space exhausted"))?;
        if let Err(e) = self.map_dma(page.vaddr(), iova, PAGE_SIZE) {
            self.iova.lock().free(iova, PAGE_SIZE);
            return Err(BdmaError::fault(format!(
                "DMA map of page {:#x} failed: {e}",
                page.vaddr()
            )));
        }
        Ok(iova)
    }

    fn unmap_page(&self, bus_addr: BusAddr) {
        self.unmap_dma(bus_addr, PAGE_SIZE);
        self.iova.lock().free(bus_addr, PAGE_SIZE);
    }
}

// ── VFIO device binding helpers ───────────────────────────────────────────────

/// Bind a BlueDMA device to `vfio-pci`, unloading any existing driver.
///
/// Steps:
/// 1. Unbind from current driver (e.g., `bdma`)
/// 2. Write vendor:device to `vfio-pci/new_id`
/// 3. Bind the device
///
/// Requires root or `CAP_SYS_ADMIN`.
///
/// # Errors
///
/// Returns an error if any sysfs write fails (usually permission denied).
pub fn bind_to_vfio(pcie_address: &str) -> Result<()> {
    tracing::info!("Binding {} to vfio-pci", pcie_address);

    let device_dir = Path::new(crate::discovery::SYSFS_PCI_DEVICES).join(pcie_address);

    // Step 1: unbind from current driver
    let driver_unbind = device_dir.join("driver/unbind");
    if driver_unbind.exists() {
        std::fs::write(&driver_unbind, pcie_address).map_err(|e| {
            BdmaError::hardware_unavailable(format!("Cannot unbind {pcie_address}: {e}"))
        })?;
        tracing::info!("Unbound from existing driver");
    }

    // Step 2: add device to vfio-pci
    let new_id = "/sys/bus/pci/drivers/vfio-pci/new_id";
    if Path::new(new_id).exists() {
        let device_id = std::fs::read_to_string(device_dir.join("device"))?;
        let device_id = device_id.trim().trim_start_matches("0x");
        std::fs::write(
            new_id,
            format!("{:04x} {device_id}", bdma_chip::pcie::XILINX_VENDOR_ID),
        )
        .map_err(|e| BdmaError::hardware_unavailable(format!("Cannot write vfio-pci/new_id: {e}")))?;
    }

    // Step 3: bind (new_id may already have bound it)
    let bound = std::fs::read_link(device_dir.join("driver"))
        .ok()
        .and_then(|p| p.file_name().map(|n| n == "vfio-pci"))
        .unwrap_or(false);
    if !bound {
        std::fs::write("/sys/bus/pci/drivers/vfio-pci/bind", pcie_address).map_err(|e| {
            BdmaError::hardware_unavailable(format!("Cannot bind to vfio-pci: {e}"))
        })?;
    }

    tracing::info!("{pcie_address} bound to vfio-pci");
    Ok(())
}

/// Unbind from `vfio-pci` and re-bind to the `bdma` kernel module if loaded.
///
/// # Errors
///
/// Returns an error if sysfs writes fail.
pub fn unbind_from_vfio(pcie_address: &str) -> Result<()> {
    let unbind = "/sys/bus/pci/drivers/vfio-pci/unbind";
    std::fs::write(unbind, pcie_address)
        .map_err(|e| BdmaError::hardware_unavailable(format!("Cannot unbind from vfio-pci: {e}")))?;

    let bind = format!("/sys/bus/pci/drivers/{}/bind", bdma_chip::pcie::MODULE_NAME);
    if Path::new(&bind).exists() {
        std::fs::write(&bind, pcie_address)
            .map_err(|e| BdmaError::hardware_unavailable(format!("Cannot bind to bdma driver: {e}")))?;
        tracing::info!("{pcie_address} re-bound to bdma");
    } else {
        tracing::info!("{pcie_address} unbound (bdma not loaded)");
    }

    Ok(())
}

/// Find the IOMMU group number for a PCIe device.
///
/// Reads `/sys/bus/pci/devices/{addr}/iommu_group` symlink.
///
/// # Errors
///
/// Returns `HardwareUnavailable` if the sysfs symlink cannot be read.
pub fn iommu_group(pcie_address: &str) -> Result<u32> {
    let link = Path::new(crate::discovery::SYSFS_PCI_DEVICES)
        .join(pcie_address)
        .join("iommu_group");
    let target = std::fs::read_link(&link).map_err(|e| {
        BdmaError::hardware_unavailable(format!(
            "Cannot read iommu_group for {pcie_address}: {e}. Is IOMMU enabled?"
        ))
    })?;

    let group = target
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| {
            BdmaError::hardware_unavailable(format!("Cannot parse IOMMU group from {target:?}"))
        })?;

    tracing::debug!("{pcie_address} → IOMMU group {group}");
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_read_request_encoding() {
        assert_eq!(encode_max_read_request(128).unwrap(), 0);
        assert_eq!(encode_max_read_request(512).unwrap(), 2 << 12);
        assert_eq!(encode_max_read_request(4096).unwrap(), 5 << 12);
        for bad in [0, 64, 384, 8192] {
            assert!(encode_max_read_request(bad).is_err());
        }
    }

    #[test]
    fn iova_space_respects_mask_and_reuses_pages() {
        let mut space = IovaSpace {
            next: IOVA_BASE,
            limit: u64::from(u32::MAX),
            free_pages: Vec::new(),
        };
        let a = space.alloc(PAGE_SIZE).unwrap();
        assert_eq!(a, IOVA_BASE);
        space.free(a, PAGE_SIZE);
        assert_eq!(space.alloc(PAGE_SIZE).unwrap(), a);
        assert!(space.alloc(u64::from(u32::MAX)).is_none());
    }

    #[test]
    #[ignore] // Requires hardware
    fn open_first_device() {
        let manager = crate::discovery::DeviceManager::discover().unwrap();
        let info = manager.device(0).unwrap();
        let function = VfioFunction::open(info.pcie_address()).unwrap();
        assert!(function.bar_len(Bar::Control).unwrap() >= Bar::Control.min_size());
    }
}
