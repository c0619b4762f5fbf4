//! Binary records exchanged with user processes.
//!
//! The layouts are fixed for compatibility with existing tools and match
//! the C structures on a 64-bit host:
//!
//! ```text
//! transfer request (24 bytes, native order)
//!   0  u64 user_address
//!   8  u64 length          (size_t)
//!  16  u32 control         0=Read 1=Write 2=RegisterMemory
//!  20  u32 (padding, ignored)
//!
//! status record (16 bytes)
//!   0  u64 addr            head page of the registered region, or 0
//!   8  u64 length          byte span of the region, or 0
//! ```

/// Size of a transfer request record; shorter writes are malformed.
pub const REQUEST_LEN: usize = 24;

/// Size of the engine status record.
pub const STATUS_LEN: usize = 16;

/// Control codes carried in a transfer request.
pub mod control {
    /// Card reads from the registered region.
    pub const READ: u32 = 0;
    /// Card writes into the registered region.
    pub const WRITE: u32 = 1;
    /// Register a memory region with the engine.
    pub const REGISTER_MEMORY: u32 = 2;
}
