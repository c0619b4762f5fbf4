//! Userspace driver for BlueDMA PCIe DMA accelerators.
//!
//! The card exposes a control window (BAR0) holding one register block and
//! one physical-address table per transfer channel, plus an optional
//! user-data window (BAR1). This crate drives it from userspace:
//!
//! - [`Device`] brings a function up and down with full rollback.
//! - [`Engine`] owns one channel: write-back buffer, address table,
//!   registered memory region.
//! - [`Engine::register`] pins and bus-maps a user buffer;
//!   [`Engine::submit`] starts a transfer inside it.
//! - [`Registry`] names attached devices' nodes and opens
//!   [`handle`]s on them.
//!
//! # Hosts
//!
//! ```text
//! VfioFunction      — vfio-pci bound function: BAR mmap, IOMMU DMA, mlock pinning
//! EmulatedFunction  — in-memory card with register-write log and fault injection
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use bdma_driver::{DeviceManager, DriverConfig, Operation};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mgr = DeviceManager::discover()?;
//! let device = mgr.open(0, DriverConfig::from_env())?;
//! let engine = device.engine(0).ok_or("no channel 0")?;
//!
//! let buffer = vec![0u8; 8192];
//! let addr = buffer.as_ptr() as u64;
//! engine.register(addr, buffer.len() as u64)?;
//! engine.submit(addr, 4096, Operation::Read)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod config;
mod device;
mod discovery;
pub mod emulated;
mod engine;
mod error;
pub mod handle;
pub mod host;
pub mod mmio;
mod registration;
mod registry;
mod transfer;
pub mod vfio;
pub mod wire;

/// Hardware identification constants (re-exported from bdma-chip).
pub mod pcie_ids {
    pub use bdma_chip::pcie::device_id;
    pub use bdma_chip::pcie::{
        is_supported, lspci_filter, ALL_DEVICE_IDS, MAX_READ_REQUEST, XILINX_VENDOR_ID,
    };
}

pub use config::DriverConfig;
pub use device::{Acquisition, Device, DmaWidth};
pub use discovery::{DeviceInfo, DeviceManager};
pub use engine::Engine;
pub use error::{BdmaError, ErrorKind, Result};
pub use handle::{ControlHandle, EngineHandle, UserWindowHandle};
pub use host::{BusAddr, BusFunction, CoherentBuffer, DmaHost, PinnedPage};
pub use registration::MemoryRegion;
pub use registry::{Handle, NodeKind, Registry};
pub use transfer::Operation;
pub use vfio::VfioFunction;
