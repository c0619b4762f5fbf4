//! Transfer submission
//!
//! A transfer names a span inside the registered region. The engine is
//! programmed with the span's offset from the region base (the card
//! translates it through the address table), its length, and finally the
//! doorbell. Submission is fire-and-forget.

use crate::engine::{lower_32, upper_32, Engine};
use crate::error::{BdmaError, Result};
use bdma_chip::desc::control;
use bdma_chip::regs::{doorbell, engine};
use std::sync::atomic::{fence, Ordering};

/// Operation carried in a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Card reads from host memory
    Read,
    /// Card writes to host memory
    Write,
    /// Register the request's buffer instead of transferring
    RegisterMemory,
}

impl Operation {
    /// Doorbell code, `None` for operations that never reach the card
    pub const fn doorbell(self) -> Option<u32> {
        match self {
            Self::Read => Some(doorbell::READ),
            Self::Write => Some(doorbell::WRITE),
            Self::RegisterMemory => None,
        }
    }
}

impl TryFrom<u32> for Operation {
    type Error = BdmaError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            control::READ => Ok(Self::Read),
            control::WRITE => Ok(Self::Write),
            control::REGISTER_MEMORY => Ok(Self::RegisterMemory),
            other => Err(BdmaError::invalid_argument(format!(
                "unknown transfer control {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::RegisterMemory => write!(f, "register"),
        }
    }
}

impl Engine {
    /// Start a transfer of `length` bytes at `user_addr`.
    ///
    /// The span must lie inside the registered region. Address and length
    /// are written before the doorbell and are visible to the card when it
    /// rings. Returns as soon as the doorbell is written.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if nothing is registered, the span leaves the
    /// region, `length` does not fit the length register, or `op` is not a
    /// transfer. No register is written on error.
    pub fn submit(&self, user_addr: u64, length: u64, op: Operation) -> Result<()> {
        let region = self.region.lock();
        let Some(mapping) = region.as_ref() else {
            return Err(BdmaError::invalid_argument(format!(
                "channel {} has no registered region",
                self.channel()
            )));
        };
        let bounds = mapping.region();

        if !bounds.contains(user_addr, length) {
            return Err(BdmaError::invalid_argument(format!(
                "transfer {user_addr:#x}+{length:#x} outside region {:#x}..{:#x}",
                bounds.head_page(),
                bounds.tail_page()
            )));
        }

        let Some(code) = op.doorbell() else {
            return Err(BdmaError::invalid_argument(format!(
                "{op} is not a transfer operation"
            )));
        };

        let len = u32::try_from(length).map_err(|_| {
            BdmaError::invalid_argument(format!("transfer length {length:#x} exceeds 32 bits"))
        })?;

        let va_offset = user_addr - bounds.head_page();

        self.regs.write(engine::DESC_ADDR_LO, lower_32(va_offset));
        self.regs.write(engine::DESC_ADDR_HI, upper_32(va_offset));
        self.regs.write(engine::DESC_LEN, len);
        fence(Ordering::Release);
        self.regs.write(engine::DOORBELL, code);

        tracing::debug!(
            "Channel {}: {op} offset={va_offset:#x} len={len:#x}",
            self.channel()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_codes() {
        assert_eq!(Operation::try_from(0).unwrap(), Operation::Read);
        assert_eq!(Operation::try_from(1).unwrap(), Operation::Write);
        assert_eq!(Operation::try_from(2).unwrap(), Operation::RegisterMemory);
        for bad in [3, 7, u32::MAX] {
            assert!(matches!(
                Operation::try_from(bad),
                Err(BdmaError::InvalidArgument { .. })
            ));
        }
    }

    #[test]
    fn only_transfers_ring_the_doorbell() {
        assert_eq!(Operation::Read.doorbell(), Some(0));
        assert_eq!(Operation::Write.doorbell(), Some(1));
        assert_eq!(Operation::RegisterMemory.doorbell(), None);
    }
}
