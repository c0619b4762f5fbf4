//! DMA engines
//!
//! One [`Engine`] per transfer channel. An engine owns:
//! - its register block inside the control window (six 32-bit slots),
//! - its slice of the physical-address table,
//! - a DMA-coherent write-back buffer whose bus address is programmed into
//!   the block at init,
//! - the currently registered memory region, behind the engine lock.
//!
//! Registration lives in [`crate::registration`], submission in
//! [`crate::transfer`]; both take the same lock so they never interleave.

use crate::error::{BdmaError, Result};
use crate::host::{BusAddr, CoherentBuffer, DmaHost};
use crate::mmio::{RegisterIo, RegisterWindow};
use crate::registration::RegionMapping;
use bdma_chip::regs::{self, engine};
use parking_lot::Mutex;
use std::sync::Arc;

/// Register block and table slice of one channel.
///
/// Offsets are validated against the window once, in [`EngineRegs::new`];
/// accesses after that go straight to the raw window.
#[derive(Debug, Clone)]
pub(crate) struct EngineRegs {
    io: Arc<dyn RegisterIo>,
    block: usize,
    table: usize,
}

impl EngineRegs {
    fn new(window: &RegisterWindow, channel: usize) -> Result<Self> {
        let block = regs::engine_block(channel);
        let table = regs::table_base(channel);
        let needed = table + regs::TABLE_BYTES;
        if channel >= regs::MAX_CHANNELS || needed > window.len() {
            return Err(BdmaError::hardware_unavailable(format!(
                "channel {channel} needs {needed:#x} bytes of control window, have {:#x}",
                window.len()
            )));
        }
        Ok(Self {
            io: Arc::clone(window.io()),
            block,
            table,
        })
    }

    pub(crate) fn write(&self, slot: usize, value: u32) {
        self.io.write_u32(self.block + slot, value);
    }

    /// Program table entry `page`: low half first, then high half.
    pub(crate) fn write_entry(&self, page: usize, bus_addr: BusAddr) {
        self.io
            .write_u32(self.table + regs::table_entry_lo(page), lower_32(bus_addr));
        self.io
            .write_u32(self.table + regs::table_entry_hi(page), upper_32(bus_addr));
    }

    pub(crate) fn clear_entries(&self, pages: std::ops::Range<usize>) {
        for page in pages {
            self.write_entry(page, 0);
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn lower_32(value: u64) -> u32 {
    value as u32
}

pub(crate) const fn upper_32(value: u64) -> u32 {
    (value >> 32) as u32
}

/// One hardware transfer channel.
#[derive(Debug)]
pub struct Engine {
    channel: usize,
    pub(crate) regs: EngineRegs,
    pub(crate) host: Arc<dyn DmaHost>,
    writeback: Option<CoherentBuffer>,
    pub(crate) region: Mutex<Option<RegionMapping>>,
}

impl Engine {
    /// Initialize channel `channel` of a mapped control window.
    ///
    /// Allocates the write-back buffer, zeroes the descriptor registers and
    /// points the block at the write-back buffer.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if the write-back buffer cannot be allocated,
    /// `HardwareUnavailable` if the window is too small for this channel.
    /// Nothing is left allocated on error.
    pub fn init(channel: usize, control: &RegisterWindow, host: Arc<dyn DmaHost>) -> Result<Self> {
        let regs = EngineRegs::new(control, channel)?;

        let writeback = host
            .alloc_coherent(regs::WRITEBACK_BYTES)
            .map_err(|e| match e {
                BdmaError::ResourceExhausted { .. } => e,
                other => BdmaError::resource_exhausted(format!(
                    "write-back buffer for channel {channel}: {other}"
                )),
            })?;
        let poll = writeback.bus_addr();

        regs.write(engine::DESC_ADDR_LO, 0);
        regs.write(engine::DESC_ADDR_HI, 0);
        regs.write(engine::DESC_LEN, 0);

        regs.write(engine::POLL_ADDR_LO, lower_32(poll));
        regs.write(engine::POLL_ADDR_HI, upper_32(poll));
        regs.write(engine::DESC_ADDR_LO, lower_32(poll));
        regs.write(engine::DESC_ADDR_HI, upper_32(poll));

        tracing::debug!("Channel {channel}: write-back buffer at bus {poll:#x}");

        Ok(Self {
            channel,
            regs,
            host,
            writeback: Some(writeback),
            region: Mutex::new(None),
        })
    }

    /// Channel index
    pub const fn channel(&self) -> usize {
        self.channel
    }

    /// Bus address programmed as the poll/write-back target
    pub fn writeback_bus_addr(&self) -> Option<BusAddr> {
        self.writeback.as_ref().map(CoherentBuffer::bus_addr)
    }

    /// True once a registration has fully succeeded
    pub fn is_registered(&self) -> bool {
        self.region.lock().is_some()
    }

    /// Base address and byte span of the registered region, zero if none
    pub fn status(&self) -> (u64, u64) {
        self.region
            .lock()
            .as_ref()
            .map_or((0, 0), |m| (m.region().head_page(), m.region().len()))
    }

    /// Number of pages of the registered region
    pub fn registered_pages(&self) -> usize {
        self.region.lock().as_ref().map_or(0, |m| m.region().pages())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(mapping) = self.region.get_mut().take() {
            self.regs.clear_entries(0..mapping.region().pages());
            drop(mapping);
        }
        if let Some(buffer) = self.writeback.take() {
            self.host.free_coherent(buffer);
        }
        tracing::debug!("Channel {} torn down", self.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::{EmulatedFunction, FaultPlan, HostEvent};
    use crate::host::BusFunction;
    use bdma_chip::bar::Bar;

    fn control(bus: &EmulatedFunction) -> RegisterWindow {
        let len = usize::try_from(bus.bar_len(Bar::Control).unwrap()).unwrap();
        RegisterWindow::new(Bar::Control, bus.map_bar(Bar::Control, len).unwrap())
    }

    #[test]
    fn init_programs_poll_address_last() {
        let bus = EmulatedFunction::new();
        let window = control(&bus);
        let engine = Engine::init(1, &window, bus.dma_host()).unwrap();
        let poll = engine.writeback_bus_addr().unwrap();

        let block = regs::engine_block(1);
        let writes = bus.control_writes();
        let offsets: Vec<usize> = writes.iter().map(|w| w.offset - block).collect();
        assert_eq!(
            offsets,
            [
                engine::DESC_ADDR_LO,
                engine::DESC_ADDR_HI,
                engine::DESC_LEN,
                engine::POLL_ADDR_LO,
                engine::POLL_ADDR_HI,
                engine::DESC_ADDR_LO,
                engine::DESC_ADDR_HI,
            ]
        );
        assert_eq!(writes[5].value, lower_32(poll));
        assert_eq!(writes[6].value, upper_32(poll));
        assert_eq!(engine.status(), (0, 0));
        assert!(!engine.is_registered());
    }

    #[test]
    fn allocation_failure_is_resource_exhausted() {
        let bus = EmulatedFunction::with_faults(FaultPlan {
            fail_coherent_on: Some(0),
            ..FaultPlan::default()
        });
        let window = control(&bus);
        let err = Engine::init(0, &window, bus.dma_host()).unwrap_err();
        assert!(matches!(err, BdmaError::ResourceExhausted { .. }));
        assert!(bus.control_writes().is_empty());
        assert_eq!(bus.live_coherent(), 0);
    }

    #[test]
    fn drop_frees_writeback_once() {
        let bus = EmulatedFunction::new();
        let window = control(&bus);
        let engine = Engine::init(0, &window, bus.dma_host()).unwrap();
        assert_eq!(bus.live_coherent(), 1);
        drop(engine);
        assert_eq!(bus.live_coherent(), 0);
        let frees = bus
            .events()
            .into_iter()
            .filter(|e| matches!(e, HostEvent::FreeCoherent(_)))
            .count();
        assert_eq!(frees, 1);
    }

    #[test]
    fn table_entry_halves() {
        let bus = EmulatedFunction::new();
        let window = control(&bus);
        let engine = Engine::init(2, &window, bus.dma_host()).unwrap();
        bus.clear_control_writes();

        engine.regs.write_entry(3, 0x1234_5678_9ABC_DEF0);
        let writes = bus.control_writes();
        let base = regs::table_base(2);
        assert_eq!(writes[0].offset, base + regs::table_entry_lo(3));
        assert_eq!(writes[0].value, 0x9ABC_DEF0);
        assert_eq!(writes[1].offset, base + regs::table_entry_hi(3));
        assert_eq!(writes[1].value, 0x1234_5678);
        assert_eq!(bus.table_entry(2, 3), 0x1234_5678_9ABC_DEF0);
    }
}
