//! Runtime device discovery
//!
//! Scans PCI sysfs for functions whose vendor/device pair is in the
//! identification table. Unrecognized functions are skipped.

use crate::config::DriverConfig;
use crate::device::Device;
use crate::error::{BdmaError, Result};
use crate::vfio::VfioFunction;
use bdma_chip::pcie;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default PCI sysfs directory
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Device manager for runtime discovery and access
#[derive(Debug)]
pub struct DeviceManager {
    devices: Vec<DeviceInfo>,
}

/// Information about a discovered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device index (0, 1, 2, ...), in PCI address order
    pub index: usize,

    /// PCIe bus address (0000:a1:00.0, etc.)
    pub pcie_address: String,

    /// PCI vendor ID
    pub vendor: u16,

    /// PCI device ID
    pub device: u16,

    /// Kernel driver currently bound, if any
    pub driver: Option<String>,

    /// sysfs directory of the function
    pub sysfs_path: PathBuf,
}

impl DeviceManager {
    /// Discover all supported devices on the system
    ///
    /// # Errors
    ///
    /// Returns `BdmaError::NoDevicesFound` if no devices are detected.
    pub fn discover() -> Result<Self> {
        Self::discover_in(Path::new(SYSFS_PCI_DEVICES))
    }

    /// Discover devices under a sysfs-style directory of PCI functions
    ///
    /// # Errors
    ///
    /// Returns `BdmaError::NoDevicesFound` if the directory cannot be read
    /// or holds no supported function.
    pub fn discover_in(root: &Path) -> Result<Self> {
        tracing::info!("Discovering BlueDMA devices in {}", root.display());

        let entries = std::fs::read_dir(root).map_err(|e| {
            tracing::error!("Cannot read {}: {e}", root.display());
            BdmaError::NoDevicesFound
        })?;

        let mut found: Vec<(String, u16, u16, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let (Ok(vendor), Ok(device)) = (
                read_hex_sysfs(&path.join("vendor")),
                read_hex_sysfs(&path.join("device")),
            ) else {
                continue;
            };
            if !pcie::is_supported(vendor, device) {
                continue;
            }
            let address = entry.file_name().to_string_lossy().to_string();
            found.push((address, vendor, device, path));
        }

        // Sort to ensure consistent ordering
        found.sort();

        let devices: Vec<DeviceInfo> = found
            .into_iter()
            .enumerate()
            .map(|(index, (pcie_address, vendor, device, sysfs_path))| {
                let driver = std::fs::read_link(sysfs_path.join("driver"))
                    .ok()
                    .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()));
                tracing::info!(
                    "Device {index}: {vendor:04x}:{device:04x} @ {pcie_address} (driver: {})",
                    driver.as_deref().unwrap_or("none")
                );
                DeviceInfo {
                    index,
                    pcie_address,
                    vendor,
                    device,
                    driver,
                    sysfs_path,
                }
            })
            .collect();

        if devices.is_empty() {
            tracing::error!("No BlueDMA devices found");
            return Err(BdmaError::NoDevicesFound);
        }

        tracing::info!("Discovered {} BlueDMA device(s)", devices.len());
        Ok(Self { devices })
    }

    /// Get number of discovered devices
    #[must_use]
    pub const fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Get slice of all devices
    #[must_use]
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Get device info by index
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the index is out of bounds.
    pub fn device(&self, index: usize) -> Result<&DeviceInfo> {
        self.devices.get(index).ok_or_else(|| {
            BdmaError::invalid_argument(format!(
                "device index {index} out of range ({} found)",
                self.devices.len()
            ))
        })
    }

    /// Bring up device `index` through VFIO
    ///
    /// # Errors
    ///
    /// Returns an error if the index is invalid, the function is not bound
    /// to `vfio-pci`, or bring-up fails.
    pub fn open(&self, index: usize, config: DriverConfig) -> Result<Device> {
        let info = self.device(index)?;
        let bus = VfioFunction::open(&info.pcie_address)?;
        Device::create(Arc::new(bus), config)
    }
}

impl DeviceInfo {
    /// Get PCIe address
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// True if bound to `vfio-pci`
    #[must_use]
    pub fn is_vfio_bound(&self) -> bool {
        self.driver.as_deref() == Some("vfio-pci")
    }
}

/// Read a hexadecimal value from sysfs
fn read_hex_sysfs(path: &Path) -> Result<u16> {
    let content = std::fs::read_to_string(path)?;
    let trimmed = content.trim().trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16)
        .map_err(|e| BdmaError::invalid_argument(format!("{}: invalid hex value: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_function(root: &Path, address: &str, vendor: &str, device: &str) {
        let dir = root.join(address);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("vendor"), format!("{vendor}\n")).unwrap();
        std::fs::write(dir.join("device"), format!("{device}\n")).unwrap();
    }

    #[test]
    fn finds_supported_functions_in_address_order() {
        let root = tempfile::tempdir().unwrap();
        fake_function(root.path(), "0000:03:00.0", "0x10ee", "0x9041");
        fake_function(root.path(), "0000:01:00.0", "0x10ee", "0x9048");
        fake_function(root.path(), "0000:02:00.0", "0x10ee", "0x7024");
        fake_function(root.path(), "0000:04:00.0", "0x8086", "0x9048");

        let manager = DeviceManager::discover_in(root.path()).unwrap();
        assert_eq!(manager.device_count(), 2);
        let first = manager.device(0).unwrap();
        assert_eq!(first.pcie_address(), "0000:01:00.0");
        assert_eq!(first.device, 0x9048);
        assert_eq!(first.driver, None);
        assert!(!first.is_vfio_bound());
        assert_eq!(manager.device(1).unwrap().device, 0x9041);
        assert!(manager.device(2).is_err());
    }

    #[test]
    fn unrecognized_only_is_no_devices() {
        let root = tempfile::tempdir().unwrap();
        fake_function(root.path(), "0000:02:00.0", "0x10ee", "0x7024");
        assert!(matches!(
            DeviceManager::discover_in(root.path()),
            Err(BdmaError::NoDevicesFound)
        ));
    }

    #[test]
    fn bound_driver_is_reported() {
        let root = tempfile::tempdir().unwrap();
        fake_function(root.path(), "0000:05:00.0", "0x10ee", "0x903f");
        let drivers = root.path().join("drivers/vfio-pci");
        std::fs::create_dir_all(&drivers).unwrap();
        std::os::unix::fs::symlink(&drivers, root.path().join("0000:05:00.0/driver")).unwrap();

        let manager = DeviceManager::discover_in(root.path()).unwrap();
        assert!(manager.device(0).unwrap().is_vfio_bound());
    }
}
