//! Device registry
//!
//! Owns attached devices and the names their handles are opened by. The
//! node table (the "class") is created when the first device attaches and
//! torn down when the last one detaches. One lock guards all of it.
//!
//! Node names per device `N`:
//!
//! | Node | Handle |
//! |------|--------|
//! | `bdma_control{N}` | [`ControlHandle`] on the control window |
//! | `bdma_c2h_{N * MAX_CHANNELS + c}` | [`EngineHandle`] for channel `c` |
//! | `bdma_user_mmap{N}` | [`UserWindowHandle`] (only with a user window) |

use crate::config::DriverConfig;
use crate::device::Device;
use crate::error::{BdmaError, Result};
use crate::handle::{ControlHandle, EngineHandle, UserWindowHandle};
use crate::host::BusFunction;
use bdma_chip::bar::Bar;
use bdma_chip::regs::MAX_CHANNELS;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a node opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Raw control window access
    Control,
    /// Transfer channel
    Engine(usize),
    /// User window mapping
    UserMmap,
}

/// An opened node.
#[derive(Debug)]
pub enum Handle {
    /// From a `bdma_control` node
    Control(ControlHandle),
    /// From a `bdma_c2h_` node
    Engine(EngineHandle),
    /// From a `bdma_user_mmap` node
    UserWindow(UserWindowHandle),
}

#[derive(Debug)]
struct NodeTable {
    devices: BTreeMap<usize, Arc<Device>>,
    nodes: BTreeMap<String, (usize, NodeKind)>,
}

impl NodeTable {
    fn new(class: &str) -> Self {
        tracing::info!("Creating node class {class}");
        Self {
            devices: BTreeMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    fn free_index(&self) -> usize {
        (0..)
            .find(|i| !self.devices.contains_key(i))
            .unwrap_or(self.devices.len())
    }
}

/// Attached devices and their nodes.
#[derive(Debug, Default)]
pub struct Registry {
    table: Mutex<Option<NodeTable>>,
}

impl Registry {
    /// Empty registry; nothing is created until the first attach
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring up `bus` and attach the resulting device.
    ///
    /// # Errors
    ///
    /// Whatever [`Device::create`] returns; nothing is registered then.
    pub fn probe(&self, bus: Arc<dyn BusFunction>, config: DriverConfig) -> Result<usize> {
        let device = Device::create(bus, config)?;
        Ok(self.attach(device))
    }

    /// Attach a live device and create its nodes; returns its index
    pub fn attach(&self, device: Device) -> usize {
        let mut guard = self.table.lock();
        let table = guard.get_or_insert_with(|| NodeTable::new(bdma_chip::pcie::MODULE_NAME));
        let index = table.free_index();

        let prefix = &device.config().module_name;
        table
            .nodes
            .insert(format!("{prefix}_control{index}"), (index, NodeKind::Control));
        for engine in device.engines() {
            let minor = index * MAX_CHANNELS + engine.channel();
            table.nodes.insert(
                format!("{prefix}_c2h_{minor}"),
                (index, NodeKind::Engine(engine.channel())),
            );
        }
        if device.user().is_some() {
            table
                .nodes
                .insert(format!("{prefix}_user_mmap{index}"), (index, NodeKind::UserMmap));
        }

        tracing::info!("Attached {} as device {index}", device.address());
        table.devices.insert(index, Arc::new(device));
        index
    }

    /// Remove device `index` and its nodes.
    ///
    /// The device is destroyed once the last open handle on it is dropped.
    /// Detaching the last device tears the node table down.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if no such device is attached.
    pub fn detach(&self, index: usize) -> Result<()> {
        let mut guard = self.table.lock();
        let table = guard
            .as_mut()
            .ok_or_else(|| BdmaError::invalid_argument("no devices attached"))?;
        let device = table
            .devices
            .remove(&index)
            .ok_or_else(|| BdmaError::invalid_argument(format!("no device {index}")))?;
        table.nodes.retain(|_, (owner, _)| *owner != index);
        tracing::info!("Detached device {index} ({})", device.address());

        if table.devices.is_empty() {
            tracing::info!("Last device gone, destroying node class");
            *guard = None;
        }
        drop(guard);
        drop(device);
        Ok(())
    }

    /// True while at least one device is attached
    pub fn is_initialized(&self) -> bool {
        self.table.lock().is_some()
    }

    /// Node names, sorted
    pub fn node_names(&self) -> Vec<String> {
        self.table
            .lock()
            .as_ref()
            .map(|t| t.nodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Attached device `index`
    pub fn device(&self, index: usize) -> Option<Arc<Device>> {
        self.table
            .lock()
            .as_ref()
            .and_then(|t| t.devices.get(&index).cloned())
    }

    /// Open the node called `name`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if there is no such node; handle open errors.
    pub fn open(&self, name: &str) -> Result<Handle> {
        let (device, kind) = {
            let guard = self.table.lock();
            let table = guard
                .as_ref()
                .ok_or_else(|| BdmaError::invalid_argument(format!("no node {name}")))?;
            let &(index, kind) = table
                .nodes
                .get(name)
                .ok_or_else(|| BdmaError::invalid_argument(format!("no node {name}")))?;
            let device = table
                .devices
                .get(&index)
                .cloned()
                .ok_or_else(|| BdmaError::invalid_argument(format!("node {name} is stale")))?;
            (device, kind)
        };

        Ok(match kind {
            NodeKind::Control => Handle::Control(ControlHandle::open(device, Bar::Control)?),
            NodeKind::Engine(channel) => Handle::Engine(EngineHandle::open(device, channel)?),
            NodeKind::UserMmap => Handle::UserWindow(UserWindowHandle::open(device)?),
        })
    }
}
