//! PCIe BAR layout.
//!
//! ```text
//! BAR  Purpose                         Access
//! ──── ─────────────────────────────── ─────────────────────────────────
//!  0   Control window                  engine register blocks + PA tables
//!  1   User-data window (optional)     raw registers, direct mmap
//! ```

use crate::regs;

/// BAR index enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Bar {
    /// BAR0 — control window.
    Control = 0,
    /// BAR1 — user-data window.
    User = 1,
}

impl Bar {
    /// BAR index used for VFIO region queries and sysfs `resourceN` files.
    #[must_use]
    pub const fn index(self) -> u8 {
        self as u8
    }

    /// Smallest size the driver accepts for this BAR.
    #[must_use]
    pub const fn min_size(self) -> u64 {
        match self {
            Self::Control => regs::CONTROL_WINDOW_MIN,
            Self::User => 4,
        }
    }
}

impl std::fmt::Display for Bar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BAR{}", self.index())
    }
}

/// Upper bound on a direct user-window mapping, independent of BAR size.
pub const USER_WINDOW_MAX: u64 = 1 << 20;
