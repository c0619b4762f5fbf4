//! Binary records exchanged with engine handles
//!
//! Native byte order, C layout, fixed sizes:
//!
//! | Record | Fields | Size |
//! |--------|--------|------|
//! | [`TransferRequest`] | `user_address: u64`, `length: u64`, `control: u32`, padding | 24 |
//! | [`StatusRecord`] | `addr: u64`, `length: u64` | 16 |

use crate::error::{BdmaError, Result};
use bdma_chip::desc::{REQUEST_LEN, STATUS_LEN};
use bytemuck::{Pod, Zeroable};

/// Transfer request written to an engine handle.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TransferRequest {
    /// User virtual address of the buffer
    pub user_address: u64,
    /// Length in bytes
    pub length: u64,
    /// 0 = read, 1 = write, 2 = register memory
    pub control: u32,
    _pad: u32,
}

const _: () = assert!(std::mem::size_of::<TransferRequest>() == REQUEST_LEN);
const _: () = assert!(std::mem::size_of::<StatusRecord>() == STATUS_LEN);

impl TransferRequest {
    /// Build a request
    #[must_use]
    pub const fn new(user_address: u64, length: u64, control: u32) -> Self {
        Self {
            user_address,
            length,
            control,
            _pad: 0,
        }
    }

    /// Parse a request from the front of `bytes`; trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `bytes` is shorter than a request.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let record = bytes.get(..REQUEST_LEN).ok_or_else(|| {
            BdmaError::invalid_argument(format!(
                "transfer request needs {REQUEST_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(bytemuck::pod_read_unaligned(record))
    }

    /// Encoded bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Registered-region status read back from an engine handle.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct StatusRecord {
    /// Base of the registered region, 0 if none
    pub addr: u64,
    /// Byte span of the registered region, 0 if none
    pub length: u64,
}

impl StatusRecord {
    /// Copy as much of the record as fits into `buf`; returns bytes copied.
    pub fn copy_to(&self, buf: &mut [u8]) -> usize {
        let bytes = bytemuck::bytes_of(self);
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        n
    }

    /// Parse a full record
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `bytes` is shorter than a record.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let record = bytes.get(..STATUS_LEN).ok_or_else(|| {
            BdmaError::invalid_argument(format!("status record needs {STATUS_LEN} bytes"))
        })?;
        Ok(bytemuck::pod_read_unaligned(record))
    }
}
