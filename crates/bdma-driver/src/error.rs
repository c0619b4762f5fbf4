//! Error types for BlueDMA driver operations

use rustix::io::Errno;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, BdmaError>;

/// Errors that can occur during driver operations
#[derive(Debug, Error)]
pub enum BdmaError {
    /// Argument rejected: out-of-bounds transfer, malformed request,
    /// region too small, unknown operation
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason for rejection
        reason: String,
    },

    /// Register access that breaks the 32-bit access protocol
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Reason for rejection
        reason: String,
    },

    /// Allocation failure or a request larger than a fixed hardware capacity
    #[error("Resource exhausted: {reason}")]
    ResourceExhausted {
        /// What ran out
        reason: String,
    },

    /// Page pinning, DMA mapping or user-memory access failed
    #[error("Fault: {reason}")]
    Fault {
        /// Reason for failure
        reason: String,
    },

    /// Bus enable, region reservation or window mapping failed
    #[error("Hardware unavailable: {reason}")]
    HardwareUnavailable {
        /// Reason for failure
        reason: String,
    },

    /// No supported devices detected on the system
    #[error("No BlueDMA devices detected")]
    NoDevicesFound,

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

/// Coarse error classes returned to callers of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied something the driver cannot accept
    InvalidArgument,
    /// Memory or table capacity exhausted
    ResourceExhausted,
    /// Pinning, mapping or copy failure
    Fault,
    /// Bring-up could not acquire the device
    HardwareUnavailable,
}

impl BdmaError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            reason: reason.into(),
        }
    }

    /// Create a fault error
    pub fn fault(reason: impl Into<String>) -> Self {
        Self::Fault {
            reason: reason.into(),
        }
    }

    /// Create a hardware unavailable error
    pub fn hardware_unavailable(reason: impl Into<String>) -> Self {
        Self::HardwareUnavailable {
            reason: reason.into(),
        }
    }

    /// Error class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } | Self::Protocol { .. } => ErrorKind::InvalidArgument,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Fault { .. } => ErrorKind::Fault,
            Self::HardwareUnavailable { .. } | Self::NoDevicesFound | Self::Io { .. } => {
                ErrorKind::HardwareUnavailable
            }
        }
    }

    /// Conventional failure code for read/write-style callers
    pub fn errno(&self) -> Errno {
        match self {
            Self::InvalidArgument { .. } => Errno::INVAL,
            Self::Protocol { .. } => Errno::PROTO,
            Self::ResourceExhausted { .. } => Errno::NOMEM,
            Self::Fault { .. } => Errno::FAULT,
            Self::HardwareUnavailable { .. } | Self::NoDevicesFound => Errno::NODEV,
            Self::Io { source } => Errno::from_io_error(source).unwrap_or(Errno::IO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_is_an_invalid_argument() {
        let e = BdmaError::protocol("offset 0x1 not 32-bit aligned");
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert_eq!(e.errno(), Errno::PROTO);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(BdmaError::invalid_argument("x").errno(), Errno::INVAL);
        assert_eq!(BdmaError::resource_exhausted("x").errno(), Errno::NOMEM);
        assert_eq!(BdmaError::fault("x").errno(), Errno::FAULT);
        assert_eq!(BdmaError::hardware_unavailable("x").errno(), Errno::NODEV);
    }
}
