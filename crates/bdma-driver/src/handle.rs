//! Device-file style handles
//!
//! The registry hands these out by node name. They are thin: parameter
//! checking and byte-level framing only, everything else is delegated to
//! [`RegisterWindow`] and [`Engine`].
//!
//! - [`ControlHandle`]: positioned 32-bit register peek/poke.
//! - [`EngineHandle`]: transfer requests in, region status out.
//! - [`UserWindowHandle`]: direct mapping of the user-data window.

use crate::device::Device;
use crate::engine::Engine;
use crate::error::{BdmaError, Result};
use crate::mmio::{RegisterIo, RegisterWindow};
use crate::transfer::Operation;
use crate::wire::{StatusRecord, TransferRequest};
use bdma_chip::bar::{Bar, USER_WINDOW_MAX};
use std::io::SeekFrom;
use std::sync::Arc;

const WORD: usize = 4;

/// Raw register access to one window of a device.
#[derive(Debug)]
pub struct ControlHandle {
    device: Arc<Device>,
    window: RegisterWindow,
    pos: u64,
}

impl ControlHandle {
    /// Open `bar` of `device`
    ///
    /// # Errors
    ///
    /// `HardwareUnavailable` if the window is not mapped.
    pub fn open(device: Arc<Device>, bar: Bar) -> Result<Self> {
        let window = match bar {
            Bar::Control => device.control(),
            Bar::User => device.user(),
        }
        .cloned()
        .ok_or_else(|| {
            BdmaError::hardware_unavailable(format!("{bar} of {} is not mapped", device.address()))
        })?;
        Ok(Self {
            device,
            window,
            pos: 0,
        })
    }

    /// Device this handle belongs to
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Current byte position
    pub const fn position(&self) -> u64 {
        self.pos
    }

    /// Move the position. Only `Start` and `Current` are supported.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for `End`, or if the new position is negative or
    /// not 4-byte aligned. The position is unchanged on error.
    pub fn seek(&mut self, to: SeekFrom) -> Result<u64> {
        let target = match to {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(_) => {
                return Err(BdmaError::invalid_argument("seek from end is not supported"));
            }
        };
        let pos = target
            .filter(|p| i64::try_from(*p).is_ok())
            .ok_or_else(|| BdmaError::invalid_argument(format!("seek {to:?} out of range")))?;
        if pos & 3 != 0 {
            return Err(BdmaError::invalid_argument(format!(
                "position {pos:#x} is not 32-bit aligned"
            )));
        }
        self.pos = pos;
        Ok(pos)
    }

    /// Read the register at the current position into the first four bytes
    /// of `buf` and advance by four.
    ///
    /// # Errors
    ///
    /// As for [`Self::read_at`]. The position is unchanged on error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Write the first four bytes of `buf` to the register at the current
    /// position and advance by four.
    ///
    /// # Errors
    ///
    /// As for [`Self::write_at`]. The position is unchanged on error.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.write_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Read the register at `offset` without moving the position.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `buf` is shorter than four bytes or `offset` is
    /// outside the window, `Protocol` if `offset` is not 4-byte aligned.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let out = buf.get_mut(..WORD).ok_or_else(|| {
            BdmaError::invalid_argument(format!("register read needs {WORD} bytes"))
        })?;
        let value = self.window.read(offset)?;
        out.copy_from_slice(&value.to_ne_bytes());
        Ok(WORD)
    }

    /// Write the register at `offset` without moving the position.
    ///
    /// # Errors
    ///
    /// As for [`Self::read_at`].
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let word: [u8; WORD] = buf
            .get(..WORD)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                BdmaError::invalid_argument(format!("register write needs {WORD} bytes"))
            })?;
        self.window.write(offset, u32::from_ne_bytes(word))?;
        Ok(WORD)
    }
}

/// Transfer channel of a device.
#[derive(Debug)]
pub struct EngineHandle {
    device: Arc<Device>,
    channel: usize,
}

impl EngineHandle {
    /// Open engine `channel` of `device`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the device has no such engine.
    pub fn open(device: Arc<Device>, channel: usize) -> Result<Self> {
        if device.engine(channel).is_none() {
            return Err(BdmaError::invalid_argument(format!(
                "{} has no channel {channel}",
                device.address()
            )));
        }
        Ok(Self { device, channel })
    }

    /// Channel index
    pub const fn channel(&self) -> usize {
        self.channel
    }

    fn engine(&self) -> Result<&Engine> {
        self.device.engine(self.channel).ok_or_else(|| {
            BdmaError::invalid_argument(format!("channel {} is gone", self.channel))
        })
    }

    /// Execute one transfer request.
    ///
    /// Read and write requests are submitted, register requests register
    /// the buffer. Returns `buf.len()`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for short or unknown requests, plus whatever
    /// [`Engine::submit`] or [`Engine::register`] returns.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let request = TransferRequest::parse(buf)?;
        let op = Operation::try_from(request.control)?;
        let engine = self.engine()?;
        match op {
            Operation::RegisterMemory => {
                engine.register(request.user_address, request.length)?;
            }
            Operation::Read | Operation::Write => {
                engine.submit(request.user_address, request.length, op)?;
            }
        }
        Ok(buf.len())
    }

    /// Current region status, truncated to `buf`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the engine is gone.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let (addr, length) = self.engine()?.status();
        Ok(StatusRecord { addr, length }.copy_to(buf))
    }
}

/// Direct access to the user-data window.
#[derive(Debug)]
pub struct UserWindowHandle {
    regs: ControlHandle,
}

impl UserWindowHandle {
    /// Open the user window of `device`
    ///
    /// # Errors
    ///
    /// `HardwareUnavailable` if the device runs without a user window.
    pub fn open(device: Arc<Device>) -> Result<Self> {
        Ok(Self {
            regs: ControlHandle::open(device, Bar::User)?,
        })
    }

    /// Map the first `len` bytes of the window.
    ///
    /// The mapping is uncached and never swapped.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `len` is zero or exceeds the window or
    /// `USER_WINDOW_MAX`; mapping errors from the host.
    pub fn map(&self, len: usize) -> Result<Arc<dyn RegisterIo>> {
        let bus = self.regs.device().bus();
        let window = bus.bar_len(Bar::User).unwrap_or(0);
        let limit = window.min(USER_WINDOW_MAX);
        if len == 0 || len as u64 > limit {
            return Err(BdmaError::invalid_argument(format!(
                "mapping of {len:#x} bytes exceeds user window limit {limit:#x}"
            )));
        }
        bus.map_bar(Bar::User, len)
    }

    /// See [`ControlHandle::seek`]
    ///
    /// # Errors
    ///
    /// As for [`ControlHandle::seek`].
    pub fn seek(&mut self, to: SeekFrom) -> Result<u64> {
        self.regs.seek(to)
    }

    /// See [`ControlHandle::read`]
    ///
    /// # Errors
    ///
    /// As for [`ControlHandle::read`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.regs.read(buf)
    }

    /// See [`ControlHandle::write`]
    ///
    /// # Errors
    ///
    /// As for [`ControlHandle::write`].
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.regs.write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::emulated::EmulatedFunction;

    fn device(config: DriverConfig) -> Arc<Device> {
        Arc::new(Device::create(Arc::new(EmulatedFunction::new()), config).unwrap())
    }

    #[test]
    fn seek_rules() {
        let mut h = ControlHandle::open(device(DriverConfig::minimal(1)), Bar::Control).unwrap();
        assert_eq!(h.seek(SeekFrom::Start(8)).unwrap(), 8);
        assert_eq!(h.seek(SeekFrom::Current(4)).unwrap(), 12);
        assert_eq!(h.seek(SeekFrom::Current(-12)).unwrap(), 0);
        assert!(h.seek(SeekFrom::Current(-4)).is_err());
        assert!(h.seek(SeekFrom::Start(6)).is_err());
        assert!(h.seek(SeekFrom::End(0)).is_err());
        assert_eq!(h.position(), 0);
    }

    #[test]
    fn read_write_advance_by_a_word() {
        let mut h = ControlHandle::open(device(DriverConfig::minimal(1)), Bar::Control).unwrap();
        h.seek(SeekFrom::Start(0x100)).unwrap();
        assert_eq!(h.write(&0xCAFE_F00D_u32.to_ne_bytes()).unwrap(), 4);
        assert_eq!(h.position(), 0x104);
        h.seek(SeekFrom::Start(0x100)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(h.read(&mut buf).unwrap(), 4);
        assert_eq!(u32::from_ne_bytes(buf[..4].try_into().unwrap()), 0xCAFE_F00D);
    }

    #[test]
    fn unaligned_offsets_are_protocol_errors() {
        let h = ControlHandle::open(device(DriverConfig::minimal(1)), Bar::Control).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(h.read_at(&mut buf, 1), Err(BdmaError::Protocol { .. })));
        assert!(matches!(h.write_at(&buf, 6), Err(BdmaError::Protocol { .. })));
        assert!(matches!(h.read_at(&mut buf, 0x10_0000), Err(BdmaError::InvalidArgument { .. })));
    }

    #[test]
    fn short_buffers_are_rejected() {
        let mut h = ControlHandle::open(device(DriverConfig::minimal(1)), Bar::Control).unwrap();
        assert!(matches!(h.read(&mut [0u8; 3]), Err(BdmaError::InvalidArgument { .. })));
        assert!(matches!(h.write(&[0u8; 2]), Err(BdmaError::InvalidArgument { .. })));
        assert_eq!(h.position(), 0);
    }

    #[test]
    fn engine_handle_rejects_unknown_channel_and_control() {
        let dev = device(DriverConfig::minimal(2));
        assert!(EngineHandle::open(Arc::clone(&dev), 2).is_err());
        let h = EngineHandle::open(dev, 1).unwrap();
        let req = TransferRequest::new(0x10_0000, 0x2000, 9);
        assert!(matches!(h.write(req.as_bytes()), Err(BdmaError::InvalidArgument { .. })));
        let mut status = [0xFFu8; 16];
        assert_eq!(h.read(&mut status).unwrap(), 16);
        assert_eq!(status, [0u8; 16]);
    }

    #[test]
    fn user_window_limits() {
        let dev = device(DriverConfig::default());
        let h = UserWindowHandle::open(Arc::clone(&dev)).unwrap();
        let size = usize::try_from(dev.bus().bar_len(Bar::User).unwrap()).unwrap();
        assert_eq!(h.map(size).unwrap().len(), size);
        assert!(h.map(size + 4096).is_err());
        assert!(h.map(0).is_err());

        let single = device(DriverConfig::minimal(1));
        assert!(UserWindowHandle::open(single).is_err());
    }
}
