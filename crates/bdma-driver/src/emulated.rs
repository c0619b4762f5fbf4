//! Emulated bus function
//!
//! An in-memory stand-in for a card and its host. It keeps:
//! - plain word arrays for both windows, with a log of every register write
//!   (the spy used to check what software programmed and in which order),
//! - counters for pinned pages, live page mappings and coherent buffers,
//! - a [`HostEvent`] log of every bus-level call,
//! - a [`FaultPlan`] that makes any host step fail on demand.
//!
//! Bus addresses are deterministic: page mappings count up from
//! [`PAGE_BUS_BASE`], coherent buffers from [`COHERENT_BUS_BASE`]. Under a
//! 32-bit DMA mask both bases drop below 4 GiB.

use crate::error::{BdmaError, Result};
use crate::host::{BusAddr, BusFunction, CoherentBuffer, DmaHost, PinnedPage};
use crate::mmio::RegisterIo;
use bdma_chip::bar::Bar;
use bdma_chip::{regs, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// First bus address handed out for page mappings (64-bit mask)
pub const PAGE_BUS_BASE: BusAddr = 0x0000_0010_8000_0000;

/// First bus address handed out for coherent buffers (64-bit mask)
pub const COHERENT_BUS_BASE: BusAddr = 0x0000_0010_C000_0000;

const LOW_4G: BusAddr = 0xFFFF_FFFF;

/// Default control window size
pub const DEFAULT_CONTROL_LEN: usize = 0x2000;

/// Default user window size
pub const DEFAULT_USER_LEN: usize = 0x1_0000;

/// One logged register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    /// Byte offset in the window
    pub offset: usize,
    /// Value written
    pub value: u32,
}

/// Bus-level call observed by the emulated host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Function enabled
    Enable,
    /// Function disabled
    Disable,
    /// Max read request programmed
    MaxReadRequest(u32),
    /// Bus mastering set or cleared
    BusMaster(bool),
    /// Regions reserved
    RequestRegions(String),
    /// Regions released
    ReleaseRegions,
    /// BAR mapped
    MapBar(Bar, usize),
    /// DMA mask accepted
    DmaMask(u32),
    /// Coherent buffer allocated
    AllocCoherent(BusAddr),
    /// Coherent buffer freed
    FreeCoherent(BusAddr),
    /// Pages pinned: head and count actually pinned
    Pin(u64, usize),
    /// Pages unpinned
    Unpin(u64, usize),
    /// Page mapped: user address and bus address
    MapPage(u64, BusAddr),
    /// Page unmapped
    UnmapPage(BusAddr),
}

/// Failure injection for every host step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// `enable` fails
    pub fail_enable: bool,
    /// `set_max_read_request` fails
    pub fail_max_read_request: bool,
    /// Setting bus mastering fails
    pub fail_bus_master: bool,
    /// `request_regions` fails as if another owner held them
    pub fail_request_regions: bool,
    /// Mapping this BAR fails
    pub fail_map_bar: Option<Bar>,
    /// 64-bit DMA mask refused
    pub refuse_dma_64: bool,
    /// 32-bit DMA mask refused
    pub refuse_dma_32: bool,
    /// The n-th coherent allocation (0-based, counted from when the plan was
    /// installed) fails
    pub fail_coherent_on: Option<usize>,
    /// At most this many pages are pinned per call
    pub pin_limit: Option<usize>,
    /// Page mapping fails after this many successful maps (counted from
    /// when the plan was installed)
    pub fail_map_after: Option<usize>,
}

/// A window's backing store and write log.
#[derive(Debug)]
struct EmulatedWindow {
    words: Mutex<Vec<u32>>,
    writes: Mutex<Vec<RegWrite>>,
    views: AtomicUsize,
}

impl EmulatedWindow {
    fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            words: Mutex::new(vec![0; len / 4]),
            writes: Mutex::new(Vec::new()),
            views: AtomicUsize::new(0),
        })
    }
}

/// Mapping of the first `len` bytes of an emulated window.
#[derive(Debug)]
struct WindowView {
    window: Arc<EmulatedWindow>,
    len: usize,
}

impl WindowView {
    fn new(window: &Arc<EmulatedWindow>, len: usize) -> Self {
        window.views.fetch_add(1, Ordering::SeqCst);
        Self {
            window: Arc::clone(window),
            len,
        }
    }
}

impl Drop for WindowView {
    fn drop(&mut self) {
        self.window.views.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RegisterIo for WindowView {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len, "Register offset out of bounds");
        self.window.words.lock()[offset / 4]
    }

    fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len, "Register offset out of bounds");
        self.window.words.lock()[offset / 4] = value;
        self.window.writes.lock().push(RegWrite { offset, value });
    }
}

#[derive(Debug, Default)]
struct State {
    faults: FaultPlan,
    enabled: bool,
    bus_master: bool,
    regions: bool,
    dma_mask: Option<u32>,
    events: Vec<HostEvent>,
    pinned: BTreeMap<u64, usize>,
    mappings: BTreeMap<BusAddr, u64>,
    coherent: BTreeSet<BusAddr>,
    next_page: u64,
    next_coherent: u64,
    coherent_attempts: usize,
    maps_done: usize,
}

impl State {
    fn bus_base(&self, base: BusAddr) -> BusAddr {
        if self.dma_mask == Some(32) {
            base & LOW_4G
        } else {
            base
        }
    }
}

#[derive(Debug)]
struct Inner {
    address: String,
    control: Arc<EmulatedWindow>,
    user: Option<Arc<EmulatedWindow>>,
    state: Mutex<State>,
}

/// Emulated PCIe function and DMA host.
///
/// Cheap to clone; clones share the same card.
#[derive(Debug, Clone)]
pub struct EmulatedFunction {
    inner: Arc<Inner>,
}

impl Default for EmulatedFunction {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedFunction {
    /// Two-window card with default sizes and no faults
    #[must_use]
    pub fn new() -> Self {
        Self::with_faults(FaultPlan::default())
    }

    /// Two-window card with default sizes and `faults` installed
    #[must_use]
    pub fn with_faults(faults: FaultPlan) -> Self {
        Self::with_layout(DEFAULT_CONTROL_LEN, Some(DEFAULT_USER_LEN), faults)
    }

    /// Card with explicit window sizes; `user_len: None` omits the user BAR
    #[must_use]
    pub fn with_layout(control_len: usize, user_len: Option<usize>, faults: FaultPlan) -> Self {
        Self {
            inner: Arc::new(Inner {
                address: "emulated:00.0".to_string(),
                control: EmulatedWindow::new(control_len),
                user: user_len.map(EmulatedWindow::new),
                state: Mutex::new(State {
                    faults,
                    ..State::default()
                }),
            }),
        }
    }

    /// Replace the fault plan and restart its counters
    pub fn set_faults(&self, faults: FaultPlan) {
        let mut state = self.inner.state.lock();
        state.faults = faults;
        state.coherent_attempts = 0;
        state.maps_done = 0;
    }

    /// Every bus-level call so far
    #[must_use]
    pub fn events(&self) -> Vec<HostEvent> {
        self.inner.state.lock().events.clone()
    }

    /// Register writes to the control window, oldest first
    #[must_use]
    pub fn control_writes(&self) -> Vec<RegWrite> {
        self.inner.control.writes.lock().clone()
    }

    /// Forget logged control window writes
    pub fn clear_control_writes(&self) {
        self.inner.control.writes.lock().clear();
    }

    /// Register writes to the user window, oldest first
    #[must_use]
    pub fn user_writes(&self) -> Vec<RegWrite> {
        self.inner
            .user
            .as_ref()
            .map(|w| w.writes.lock().clone())
            .unwrap_or_default()
    }

    /// Current value of the control window word at byte `offset`
    #[must_use]
    pub fn control_word(&self, offset: usize) -> u32 {
        self.inner.control.words.lock()[offset / 4]
    }

    /// Bus address held in table entry `page` of `channel`
    #[must_use]
    pub fn table_entry(&self, channel: usize, page: usize) -> BusAddr {
        let base = regs::table_base(channel);
        let lo = self.control_word(base + regs::table_entry_lo(page));
        let hi = self.control_word(base + regs::table_entry_hi(page));
        (u64::from(hi) << 32) | u64::from(lo)
    }

    /// Pages currently pinned, counting a page once per pin
    #[must_use]
    pub fn pinned_pages(&self) -> usize {
        self.inner.state.lock().pinned.values().sum()
    }

    /// Page mappings currently live
    #[must_use]
    pub fn live_mappings(&self) -> usize {
        self.inner.state.lock().mappings.len()
    }

    /// Bus addresses of live page mappings, ascending
    #[must_use]
    pub fn mapped_bus_addrs(&self) -> Vec<BusAddr> {
        self.inner.state.lock().mappings.keys().copied().collect()
    }

    /// Coherent buffers currently allocated
    #[must_use]
    pub fn live_coherent(&self) -> usize {
        self.inner.state.lock().coherent.len()
    }

    /// BAR views currently mapped
    #[must_use]
    pub fn live_bar_maps(&self) -> usize {
        let user = self
            .inner
            .user
            .as_ref()
            .map_or(0, |w| w.views.load(Ordering::SeqCst));
        self.inner.control.views.load(Ordering::SeqCst) + user
    }

    /// Function enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().enabled
    }

    /// Bus mastering set
    #[must_use]
    pub fn is_bus_master(&self) -> bool {
        self.inner.state.lock().bus_master
    }

    /// Regions reserved
    #[must_use]
    pub fn holds_regions(&self) -> bool {
        self.inner.state.lock().regions
    }

    /// Accepted DMA mask width
    #[must_use]
    pub fn dma_mask(&self) -> Option<u32> {
        self.inner.state.lock().dma_mask
    }

    /// Nothing acquired: disabled, no bus mastering, no regions, no BAR
    /// views, no pins, no mappings, no coherent buffers
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        let bars = self.live_bar_maps();
        let state = self.inner.state.lock();
        !state.enabled
            && !state.bus_master
            && !state.regions
            && bars == 0
            && state.pinned.is_empty()
            && state.mappings.is_empty()
            && state.coherent.is_empty()
    }

    fn window(&self, bar: Bar) -> Option<&Arc<EmulatedWindow>> {
        match bar {
            Bar::Control => Some(&self.inner.control),
            Bar::User => self.inner.user.as_ref(),
        }
    }
}

impl BusFunction for EmulatedFunction {
    fn address(&self) -> &str {
        &self.inner.address
    }

    fn enable(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.faults.fail_enable {
            return Err(BdmaError::hardware_unavailable("emulated enable failure"));
        }
        state.enabled = true;
        state.events.push(HostEvent::Enable);
        Ok(())
    }

    fn disable(&self) {
        let mut state = self.inner.state.lock();
        state.enabled = false;
        state.events.push(HostEvent::Disable);
    }

    fn set_max_read_request(&self, bytes: u32) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.faults.fail_max_read_request {
            return Err(BdmaError::hardware_unavailable("emulated MRRS failure"));
        }
        state.events.push(HostEvent::MaxReadRequest(bytes));
        Ok(())
    }

    fn set_bus_master(&self, enable: bool) -> Result<()> {
        let mut state = self.inner.state.lock();
        if enable && state.faults.fail_bus_master {
            return Err(BdmaError::hardware_unavailable("emulated bus master failure"));
        }
        state.bus_master = enable;
        state.events.push(HostEvent::BusMaster(enable));
        Ok(())
    }

    fn request_regions(&self, owner: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.faults.fail_request_regions {
            return Err(BdmaError::hardware_unavailable("regions held by another owner"));
        }
        state.regions = true;
        state.events.push(HostEvent::RequestRegions(owner.to_string()));
        Ok(())
    }

    fn release_regions(&self) {
        let mut state = self.inner.state.lock();
        state.regions = false;
        state.events.push(HostEvent::ReleaseRegions);
    }

    fn bar_len(&self, bar: Bar) -> Option<u64> {
        self.window(bar).map(|w| w.words.lock().len() as u64 * 4)
    }

    fn map_bar(&self, bar: Bar, len: usize) -> Result<Arc<dyn RegisterIo>> {
        let mut state = self.inner.state.lock();
        if state.faults.fail_map_bar == Some(bar) {
            return Err(BdmaError::hardware_unavailable(format!("emulated {bar} map failure")));
        }
        let window = self
            .window(bar)
            .ok_or_else(|| BdmaError::hardware_unavailable(format!("{bar} not implemented")))?;
        if len == 0 || len > window.words.lock().len() * 4 {
            return Err(BdmaError::invalid_argument(format!("{bar} map of {len:#x} bytes")));
        }
        state.events.push(HostEvent::MapBar(bar, len));
        Ok(Arc::new(WindowView::new(window, len)))
    }

    fn set_dma_mask(&self, bits: u32) -> Result<()> {
        let mut state = self.inner.state.lock();
        let refused = match bits {
            64 => state.faults.refuse_dma_64,
            32 => state.faults.refuse_dma_32,
            _ => true,
        };
        if refused {
            return Err(BdmaError::hardware_unavailable(format!("{bits}-bit DMA refused")));
        }
        state.dma_mask = Some(bits);
        state.events.push(HostEvent::DmaMask(bits));
        Ok(())
    }

    fn dma_host(&self) -> Arc<dyn DmaHost> {
        Arc::new(self.clone())
    }
}

impl DmaHost for EmulatedFunction {
    fn alloc_coherent(&self, len: usize) -> Result<CoherentBuffer> {
        let mut state = self.inner.state.lock();
        let attempt = state.coherent_attempts;
        state.coherent_attempts += 1;
        if state.faults.fail_coherent_on == Some(attempt) {
            return Err(BdmaError::resource_exhausted("emulated coherent allocation failure"));
        }
        let bus = state.bus_base(COHERENT_BUS_BASE) + state.next_coherent * PAGE_SIZE;
        state.next_coherent += 1;
        state.coherent.insert(bus);
        state.events.push(HostEvent::AllocCoherent(bus));
        Ok(CoherentBuffer::new(bus, len))
    }

    fn free_coherent(&self, buffer: CoherentBuffer) {
        let mut state = self.inner.state.lock();
        let bus = buffer.bus_addr();
        assert!(state.coherent.remove(&bus), "coherent buffer {bus:#x} freed twice");
        state.events.push(HostEvent::FreeCoherent(bus));
    }

    fn pin_user_pages(&self, head: u64, count: usize) -> Vec<PinnedPage> {
        let mut state = self.inner.state.lock();
        let n = state.faults.pin_limit.map_or(count, |limit| count.min(limit));
        let pages: Vec<PinnedPage> = (0..n as u64)
            .map(|i| PinnedPage::new(head + i * PAGE_SIZE))
            .collect();
        for page in &pages {
            *state.pinned.entry(page.vaddr()).or_default() += 1;
        }
        state.events.push(HostEvent::Pin(head, n));
        pages
    }

    fn unpin_user_pages(&self, pages: Vec<PinnedPage>) {
        let mut state = self.inner.state.lock();
        let head = pages.first().map_or(0, PinnedPage::vaddr);
        for page in &pages {
            let Some(count) = state.pinned.get_mut(&page.vaddr()) else {
                panic!("page {:#x} unpinned twice", page.vaddr());
            };
            *count -= 1;
            if *count == 0 {
                state.pinned.remove(&page.vaddr());
            }
        }
        state.events.push(HostEvent::Unpin(head, pages.len()));
    }

    fn map_page(&self, page: &PinnedPage) -> Result<BusAddr> {
        let mut state = self.inner.state.lock();
        if state.faults.fail_map_after == Some(state.maps_done) {
            return Err(BdmaError::fault(format!(
                "emulated map failure at {:#x}",
                page.vaddr()
            )));
        }
        state.maps_done += 1;
        let bus = state.bus_base(PAGE_BUS_BASE) + state.next_page * PAGE_SIZE;
        state.next_page += 1;
        state.mappings.insert(bus, page.vaddr());
        state.events.push(HostEvent::MapPage(page.vaddr(), bus));
        Ok(bus)
    }

    fn unmap_page(&self, bus_addr: BusAddr) {
        let mut state = self.inner.state.lock();
        assert!(
            state.mappings.remove(&bus_addr).is_some(),
            "bus address {bus_addr:#x} unmapped twice"
        );
        state.events.push(HostEvent::UnmapPage(bus_addr));
    }
}
