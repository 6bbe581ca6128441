//! PCI sysfs discovery
//!
//! Finds audio DSP functions by class code in `/sys/bus/pci/devices/*/uevent`.
//! The sysfs root is a parameter so the scan can run against a fake tree.

use crate::error::{CavsError, Result};
use cavs_chip::pcie::{is_dsp_class, ChipGeneration};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default sysfs directory holding one entry per PCI function.
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// A PCI function with an audio DSP class code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Sysfs directory of the function.
    pub pci_dir: PathBuf,
    /// PCI address (`0000:00:1f.3`).
    pub address: String,
    /// 24-bit class register.
    pub class: u32,
    /// Device id, when readable.
    pub device_id: Option<u16>,
    /// Module of the bound kernel driver, if any.
    pub driver_module: Option<String>,
}

impl DeviceInfo {
    /// Hardware generation, if the device id is one we know.
    pub fn generation(&self) -> Option<ChipGeneration> {
        self.device_id.and_then(ChipGeneration::from_device_id)
    }
}

/// Scan the system sysfs tree.
///
/// # Errors
///
/// As for [`discover_in`].
pub fn discover() -> Result<Vec<DeviceInfo>> {
    discover_in(Path::new(SYSFS_PCI_DEVICES))
}

/// Every DSP-class function under `root`, sorted by address.
///
/// # Errors
///
/// Returns [`CavsError::DeviceNotFound`] if `root` cannot be listed.
pub fn discover_in(root: &Path) -> Result<Vec<DeviceInfo>> {
    let entries = std::fs::read_dir(root).map_err(|_| CavsError::device_not_found(root))?;
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let pci_dir = entry.path();
        let Some(class) = read_uevent_class(&pci_dir.join("uevent")) else {
            continue;
        };
        if !is_dsp_class(class) {
            continue;
        }
        let address = entry.file_name().to_string_lossy().into_owned();
        debug!("Audio DSP class {class:#08x} at {address}");
        found.push(DeviceInfo {
            device_id: read_hex_sysfs(&pci_dir.join("device")).ok(),
            driver_module: driver_module(&pci_dir),
            address,
            class,
            pci_dir,
        });
    }
    found.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(found)
}

/// The first DSP found under `root`.
///
/// # Errors
///
/// Returns [`CavsError::NoDevicesFound`] if there is none.
pub fn find_first_in(root: &Path) -> Result<DeviceInfo> {
    let device = discover_in(root)?
        .into_iter()
        .next()
        .ok_or(CavsError::NoDevicesFound)?;
    info!("Using audio DSP at {}", device.address);
    Ok(device)
}

/// The first DSP on this system.
///
/// # Errors
///
/// As for [`find_first_in`].
pub fn find_first() -> Result<DeviceInfo> {
    find_first_in(Path::new(SYSFS_PCI_DEVICES))
}

fn read_uevent_class(path: &Path) -> Option<u32> {
    let uevent = std::fs::read_to_string(path).ok()?;
    uevent
        .lines()
        .find_map(|line| line.strip_prefix("PCI_CLASS="))
        .and_then(|hex| u32::from_str_radix(hex.trim(), 16).ok())
}

/// Name of the kernel module bound to the function at `pci_dir`.
pub fn driver_module(pci_dir: &Path) -> Option<String> {
    let module = std::fs::read_link(pci_dir.join("driver").join("module")).ok()?;
    module
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Read a sysfs hex attribute such as `device` (`0x9dc8\n`).
///
/// # Errors
///
/// Returns [`CavsError::DeviceNotFound`] if the file is missing or not a
/// 16-bit hex value.
pub fn read_hex_sysfs(path: &Path) -> Result<u16> {
    let content = std::fs::read_to_string(path).map_err(|_| CavsError::device_not_found(path))?;
    let trimmed = content.trim().trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16).map_err(|_| CavsError::device_not_found(path))
}
