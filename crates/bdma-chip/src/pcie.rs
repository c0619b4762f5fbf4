//! PCIe identifiers claimed by the driver.
//!
//! The card is a Xilinx-based FPGA design; the device IDs below are the
//! bitstream variants the driver binds to. Anything else is not probed.

/// Xilinx vendor ID (PCI-SIG assigned).
pub const XILINX_VENDOR_ID: u16 = 0x10EE;

/// Device IDs for BlueDMA bitstreams.
pub mod device_id {
    /// Gen3 x8 bitstream.
    pub const BDMA_9048: u16 = 0x9048;
    /// Gen3 x4 bitstream.
    pub const BDMA_9044: u16 = 0x9044;
    /// Gen3 x2 bitstream.
    pub const BDMA_9042: u16 = 0x9042;
    /// Gen3 x1 bitstream.
    pub const BDMA_9041: u16 = 0x9041;
    /// Gen2 bitstream.
    pub const BDMA_903F: u16 = 0x903F;
}

/// All device IDs the driver binds to (all under [`XILINX_VENDOR_ID`]).
pub const ALL_DEVICE_IDS: &[u16] = &[
    device_id::BDMA_9048,
    device_id::BDMA_9044,
    device_id::BDMA_9042,
    device_id::BDMA_9041,
    device_id::BDMA_903F,
];

/// Maximum read request size negotiated at bring-up (bytes).
pub const MAX_READ_REQUEST: u32 = 512;

/// Driver/module name, also the prefix of every device node.
pub const MODULE_NAME: &str = "bdma";

/// True if the driver claims this vendor/device pair.
#[must_use]
pub fn is_supported(vendor: u16, device: u16) -> bool {
    vendor == XILINX_VENDOR_ID && ALL_DEVICE_IDS.contains(&device)
}

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{XILINX_VENDOR_ID:04x}:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_only_listed_ids() {
        for &id in ALL_DEVICE_IDS {
            assert!(is_supported(XILINX_VENDOR_ID, id));
        }
        assert!(!is_supported(XILINX_VENDOR_ID, 0x7024));
        assert!(!is_supported(0x1E7C, device_id::BDMA_9048));
    }
}
