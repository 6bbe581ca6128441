//! Error types for cAVS driver operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cAVS operations
pub type Result<T> = std::result::Result<T, CavsError>;

/// Errors that can occur while driving an audio DSP
#[derive(Debug, Error)]
pub enum CavsError {
    /// Device directory or BAR resource not found
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No audio DSP detected on the PCI bus
    #[error("No audio DSP devices detected")]
    NoDevicesFound,

    /// PCI device id missing from the generation table
    #[error("Unsupported device id {device_id:#06x}")]
    UnsupportedDevice {
        /// PCI device id read from sysfs
        device_id: u16,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Firmware image could not be read
    #[error("Cannot read firmware {path}: {source}")]
    FirmwareRead {
        /// Image path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Firmware image does not fit the transfer buffer
    #[error("Firmware image is {len} bytes, transfer buffer holds {max}")]
    FirmwareTooLarge {
        /// Image length after manifest trimming
        len: usize,
        /// Largest image the DMA layout can carry
        max: usize,
    },

    /// Huge page allocation or physical address lookup failed
    #[error("Huge page allocation failed: {reason}")]
    HugePage {
        /// Reason for failure
        reason: String,
    },

    /// BAR mapping failed
    #[error("Mapping failed: {reason}")]
    Mapping {
        /// Reason for failure
        reason: String,
    },

    /// Register window declared past the end of its mapping
    #[error("Invalid register layout: {reason}")]
    RegisterLayout {
        /// Reason for failure
        reason: String,
    },

    /// Bounded hardware poll expired
    #[error("Timeout after {duration_ms}ms waiting for {what}")]
    Timeout {
        /// What was being waited for
        what: &'static str,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Firmware did not report FW_ENTERED in time
    #[error("Firmware load failed, FW_STATUS = {status:#010x}")]
    FirmwareLoad {
        /// Last firmware status word observed
        status: u32,
    },

    /// Access outside a memory window
    #[error("Window access out of bounds: offset={offset:#x} len={len} limit={limit:#x}")]
    WindowBounds {
        /// Start offset of the access
        offset: usize,
        /// Length of the access
        len: usize,
        /// Size of the window
        limit: usize,
    },
}

impl CavsError {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create a huge page error
    pub fn huge_page(reason: impl Into<String>) -> Self {
        Self::HugePage {
            reason: reason.into(),
        }
    }

    /// Create a mapping error
    pub fn mapping(reason: impl Into<String>) -> Self {
        Self::Mapping {
            reason: reason.into(),
        }
    }

    /// Create a register layout error
    pub fn register_layout(reason: impl Into<String>) -> Self {
        Self::RegisterLayout {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: &'static str, duration: std::time::Duration) -> Self {
        Self::Timeout {
            what,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
