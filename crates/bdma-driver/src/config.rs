//! Driver configuration
//!
//! Defaults come from the silicon model; each field can be overridden from
//! the environment (`BDMA_CHANNELS`, `BDMA_MAX_READ_REQUEST`,
//! `BDMA_USER_WINDOW`).

use bdma_chip::{pcie, regs};

/// Bring-up parameters for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Owner name used when reserving regions and naming nodes
    pub module_name: String,

    /// Number of engines to initialize (1..=`MAX_CHANNELS`)
    pub channels: usize,

    /// Maximum read request size to negotiate (best effort)
    pub max_read_request: u32,

    /// Map the second (user-data) window as well as the control window
    pub map_user_window: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            module_name: pcie::MODULE_NAME.to_string(),
            channels: regs::MAX_CHANNELS,
            max_read_request: pcie::MAX_READ_REQUEST,
            map_user_window: true,
        }
    }
}

impl DriverConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("BDMA_CHANNELS") {
            match value.trim().parse::<usize>() {
                Ok(n) => config.channels = n,
                Err(e) => tracing::warn!("Ignoring BDMA_CHANNELS={value}: {e}"),
            }
        }

        if let Ok(value) = std::env::var("BDMA_MAX_READ_REQUEST") {
            match value.trim().parse::<u32>() {
                Ok(n) => config.max_read_request = n,
                Err(e) => tracing::warn!("Ignoring BDMA_MAX_READ_REQUEST={value}: {e}"),
            }
        }

        if let Ok(value) = std::env::var("BDMA_USER_WINDOW") {
            match value.trim() {
                "0" | "false" | "no" => config.map_user_window = false,
                "1" | "true" | "yes" => config.map_user_window = true,
                other => tracing::warn!("Ignoring BDMA_USER_WINDOW={other}"),
            }
        }

        config.normalized()
    }

    /// Clamp the channel count to what the card provides.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let clamped = self.channels.clamp(1, regs::MAX_CHANNELS);
        if clamped != self.channels {
            tracing::warn!(
                "Channel count {} out of range, using {clamped}",
                self.channels
            );
            self.channels = clamped;
        }
        self
    }

    /// Single-window configuration with `channels` engines
    #[cfg(test)]
    pub fn minimal(channels: usize) -> Self {
        Self {
            channels,
            map_user_window: false,
            ..Self::default()
        }
    }
}
