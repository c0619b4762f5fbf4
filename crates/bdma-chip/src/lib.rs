//! Silicon model for the BlueDMA PCIe DMA engine.
//!
//! This crate has **no dependencies** and **no hardware access** — it is a
//! pure model of the card: PCI identifiers, BAR layout, the control-window
//! register map, engine and address-table geometry, and the fixed binary
//! records exchanged with user processes.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device ID table, read-request size |
//! | [`bar`] | BAR layout (BAR0 control window, BAR1 user-data window) |
//! | [`regs`] | Engine register block, address table geometry, doorbell codes |
//! | [`desc`] | Transfer request and status record layouts |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod desc;
pub mod pcie;
pub mod regs;

/// Host page size assumed by the address table (one entry per page).
pub const PAGE_SIZE: u64 = 4096;

/// Round `addr` down to its page boundary.
#[must_use]
pub const fn page_floor(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round `addr` up to the next page boundary.
///
/// Returns `None` if the rounded value does not fit in 64 bits.
#[must_use]
pub const fn page_ceil(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}
