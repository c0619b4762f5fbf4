//! Device lifecycle
//!
//! [`Device::create`] brings a PCIe function up in a fixed order:
//!
//! 1. enable the function
//! 2. max read request (best effort)
//! 3. bus mastering
//! 4. reserve regions
//! 5. map the control window, then the user window
//! 6. DMA mask: 64-bit, falling back to 32-bit
//! 7. initialize every engine
//!
//! The Device records each acquisition as it happens. Dropping it, including
//! a half-built one when a step above fails, releases engines and windows
//! and then pops the acquisition stack in reverse.

use crate::config::DriverConfig;
use crate::engine::Engine;
use crate::error::{BdmaError, Result};
use crate::host::BusFunction;
use crate::mmio::RegisterWindow;
use bdma_chip::bar::Bar;
use std::sync::Arc;

/// Bus-level resource held by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Function enabled
    Enabled,
    /// Bus mastering set
    BusMaster,
    /// Memory regions reserved
    Regions,
}

/// Negotiated DMA addressing width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaWidth {
    /// 64-bit bus addresses
    Bits64,
    /// 32-bit fallback
    Bits32,
}

impl DmaWidth {
    /// Mask width in bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits64 => 64,
            Self::Bits32 => 32,
        }
    }
}

/// One attached PCIe function with its engines.
#[derive(Debug)]
pub struct Device {
    bus: Arc<dyn BusFunction>,
    config: DriverConfig,
    acquired: Vec<Acquisition>,
    control: Option<RegisterWindow>,
    user: Option<RegisterWindow>,
    dma_width: Option<DmaWidth>,
    engines: Vec<Engine>,
}

impl Device {
    /// Bring up `bus` and initialize `config.channels` engines.
    ///
    /// # Errors
    ///
    /// `HardwareUnavailable` if enabling, bus mastering, region reservation,
    /// window mapping or DMA mask negotiation fails; `ResourceExhausted` if
    /// an engine's write-back buffer cannot be allocated. Every completed
    /// step is undone before the error is returned.
    pub fn create(bus: Arc<dyn BusFunction>, config: DriverConfig) -> Result<Self> {
        let config = config.normalized();
        let address = bus.address().to_string();
        tracing::info!("Bringing up {address} with {} channels", config.channels);

        let mut device = Self {
            bus,
            config,
            acquired: Vec::with_capacity(3),
            control: None,
            user: None,
            dma_width: None,
            engines: Vec::new(),
        };

        device.bus.enable()?;
        device.acquired.push(Acquisition::Enabled);

        if let Err(e) = device
            .bus
            .set_max_read_request(device.config.max_read_request)
        {
            tracing::warn!(
                "{address}: max read request {} not applied: {e}",
                device.config.max_read_request
            );
        }

        device.bus.set_bus_master(true)?;
        device.acquired.push(Acquisition::BusMaster);

        device.bus.request_regions(&device.config.module_name)?;
        device.acquired.push(Acquisition::Regions);

        device.control = Some(device.map_window(Bar::Control)?);
        if device.config.map_user_window {
            device.user = Some(device.map_window(Bar::User)?);
        }

        device.dma_width = Some(device.negotiate_dma()?);

        let host = device.bus.dma_host();
        for channel in 0..device.config.channels {
            let engine = match device.control.as_ref() {
                Some(control) => Engine::init(channel, control, Arc::clone(&host))?,
                None => return Err(BdmaError::hardware_unavailable("control window not mapped")),
            };
            device.engines.push(engine);
        }

        tracing::info!(
            "{address}: up, {} engines, {}-bit DMA",
            device.engines.len(),
            device.dma_width.map_or(0, DmaWidth::bits)
        );
        Ok(device)
    }

    fn map_window(&self, bar: Bar) -> Result<RegisterWindow> {
        let size = self.bus.bar_len(bar).ok_or_else(|| {
            BdmaError::hardware_unavailable(format!("{} does not implement {bar}", self.bus.address()))
        })?;
        if size < bar.min_size() {
            return Err(BdmaError::hardware_unavailable(format!(
                "{bar} is {size:#x} bytes, need at least {:#x}",
                bar.min_size()
            )));
        }
        let len = usize::try_from(size)
            .map_err(|_| BdmaError::hardware_unavailable(format!("{bar} size {size:#x} too large")))?;
        let io = self.bus.map_bar(bar, len)?;
        tracing::debug!("{}: mapped {bar}, {len:#x} bytes", self.bus.address());
        Ok(RegisterWindow::new(bar, io))
    }

    fn negotiate_dma(&self) -> Result<DmaWidth> {
        for width in [DmaWidth::Bits64, DmaWidth::Bits32] {
            match self.bus.set_dma_mask(width.bits()) {
                Ok(()) => return Ok(width),
                Err(e) => tracing::debug!(
                    "{}: {}-bit DMA refused: {e}",
                    self.bus.address(),
                    width.bits()
                ),
            }
        }
        Err(BdmaError::hardware_unavailable(format!(
            "{}: no usable DMA mask",
            self.bus.address()
        )))
    }

    /// Tear the device down (equivalent to dropping it).
    pub fn destroy(self) {
        tracing::info!("Destroying {}", self.bus.address());
        drop(self);
    }

    /// PCI address of the function
    #[must_use]
    pub fn address(&self) -> &str {
        self.bus.address()
    }

    /// Configuration the device was brought up with
    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Control window
    #[must_use]
    pub fn control(&self) -> Option<&RegisterWindow> {
        self.control.as_ref()
    }

    /// User-data window, if mapped
    #[must_use]
    pub fn user(&self) -> Option<&RegisterWindow> {
        self.user.as_ref()
    }

    /// Negotiated DMA width
    #[must_use]
    pub const fn dma_width(&self) -> Option<DmaWidth> {
        self.dma_width
    }

    /// Engines, indexed by channel
    #[must_use]
    pub fn engines(&self) -> &[Engine] {
        &self.engines
    }

    /// Engine for `channel`
    #[must_use]
    pub fn engine(&self, channel: usize) -> Option<&Engine> {
        self.engines.get(channel)
    }

    /// Bus resources currently held, in acquisition order
    #[must_use]
    pub fn acquisitions(&self) -> &[Acquisition] {
        &self.acquired
    }

    /// Underlying bus function
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn BusFunction> {
        &self.bus
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        while let Some(engine) = self.engines.pop() {
            drop(engine);
        }
        self.user = None;
        self.control = None;

        while let Some(step) = self.acquired.pop() {
            match step {
                Acquisition::Regions => self.bus.release_regions(),
                Acquisition::BusMaster => {
                    if let Err(e) = self.bus.set_bus_master(false) {
                        tracing::error!("{}: clearing bus master failed: {e}", self.bus.address());
                    }
                }
                Acquisition::Enabled => self.bus.disable(),
            }
        }
    }
}
