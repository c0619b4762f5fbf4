//! Control-window register map.
//!
//! ```text
//! 0x0000 ┌──────────────────────────┐
//!        │ engine 0 register block  │  6 × u32, stride 0x20
//! 0x0020 │ engine 1 register block  │
//!        │ ...                      │
//! 0x1000 ├──────────────────────────┤  word 0x400
//!        │ engine 0 PA table        │  MAX_PAGES × (hi, lo)
//! 0x1200 │ engine 1 PA table        │
//!        │ ...                      │
//! 0x1800 └──────────────────────────┘
//! ```
//!
//! Table entry `i` of a channel holds the bus address of page `i` of the
//! registered region: the high half at word `2i`, the low half at `2i + 1`.

use crate::PAGE_SIZE;

// ── Engines ──────────────────────────────────────────────────────────────────

/// Number of DMA engines (card-to-host channels) on the card.
pub const MAX_CHANNELS: usize = 4;

/// Stride between engine register blocks.
pub const ENGINE_STRIDE: usize = 0x20;

/// Offsets of the six slots within an engine register block.
pub mod engine {
    /// Doorbell: writing an operation code starts the transfer.
    pub const DOORBELL: usize = 0x00;
    /// Descriptor address, low 32 bits.
    pub const DESC_ADDR_LO: usize = 0x04;
    /// Descriptor address, high 32 bits.
    pub const DESC_ADDR_HI: usize = 0x08;
    /// Descriptor length in bytes.
    pub const DESC_LEN: usize = 0x0C;
    /// Poll/write-back address, low 32 bits.
    pub const POLL_ADDR_LO: usize = 0x10;
    /// Poll/write-back address, high 32 bits.
    pub const POLL_ADDR_HI: usize = 0x14;
    /// Bytes of the block actually decoded by hardware.
    pub const BLOCK_LEN: usize = 0x18;
}

/// Byte offset of the register block for `channel`.
#[must_use]
pub const fn engine_block(channel: usize) -> usize {
    channel * ENGINE_STRIDE
}

// ── Physical-address tables ──────────────────────────────────────────────────

/// Pages one engine's table can describe.
pub const MAX_PAGES: usize = 64;

/// First 32-bit word of the table region.
pub const TABLE_REGION_WORD: usize = 0x400;

/// Bytes occupied by one channel's table.
pub const TABLE_BYTES: usize = MAX_PAGES * 2 * 4;

/// Byte offset of the address table for `channel`.
#[must_use]
pub const fn table_base(channel: usize) -> usize {
    (channel * MAX_PAGES * 2 + TABLE_REGION_WORD) * 4
}

/// Byte offset, relative to the table base, of the high half of entry `page`.
#[must_use]
pub const fn table_entry_hi(page: usize) -> usize {
    page * 2 * 4
}

/// Byte offset, relative to the table base, of the low half of entry `page`.
#[must_use]
pub const fn table_entry_lo(page: usize) -> usize {
    (page * 2 + 1) * 4
}

/// Smallest control window that holds every register block and table.
pub const CONTROL_WINDOW_MIN: u64 = table_base(MAX_CHANNELS) as u64;

/// Largest byte span a single registration may cover.
pub const MAX_REGION_BYTES: u64 = MAX_PAGES as u64 * PAGE_SIZE;

// ── Doorbell codes ───────────────────────────────────────────────────────────

/// Operation codes written to the doorbell.
pub mod doorbell {
    /// Card reads from host memory.
    pub const READ: u32 = 0;
    /// Card writes to host memory.
    pub const WRITE: u32 = 1;
}

// ── Write-back record ────────────────────────────────────────────────────────

/// Size of the poll/write-back record the card may update.
pub const WRITEBACK_BYTES: usize = 8;
