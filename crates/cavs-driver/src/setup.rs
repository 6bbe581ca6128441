//! OS preparation before the BARs are touched
//!
//! These are thin shims over sysfs and a couple of system commands: take
//! the device away from any kernel driver, keep runtime PM from suspending
//! it, open up PCI config space, and make sure hugetlbfs is mounted.

use crate::discovery::driver_module;
use anyhow::{bail, Context, Result};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// PCI command register offset in config space.
const PCI_COMMAND: u64 = 4;

/// Memory space + bus master enable, INTx disable.
const PCI_COMMAND_VALUE: [u8; 2] = [0x06, 0x04];

/// Prepares one PCI function for userspace access.
#[derive(Debug, Clone)]
pub struct DeviceSetup {
    pci_dir: PathBuf,
    readonly: bool,
}

impl DeviceSetup {
    /// Setup for the function at `pci_dir`.
    pub fn new(pci_dir: impl Into<PathBuf>) -> Self {
        Self {
            pci_dir: pci_dir.into(),
            readonly: false,
        }
    }

    /// Leave a bound kernel driver in place (log-only use).
    #[must_use]
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Run every step.
    ///
    /// # Errors
    ///
    /// Fails if the driver cannot be unloaded or config space cannot be
    /// written.
    pub fn run(&self) -> Result<()> {
        self.release_driver()?;
        self.enable_config()?;
        Ok(())
    }

    /// Unload the module bound to the device and force runtime PM on.
    ///
    /// # Errors
    ///
    /// Fails if `rmmod` fails or `power/control` cannot be written.
    pub fn release_driver(&self) -> Result<()> {
        let Some(module) = driver_module(&self.pci_dir) else {
            return Ok(());
        };
        if self.readonly {
            info!("Existing driver \"{module}\" found");
            return Ok(());
        }
        warn!("Existing driver \"{module}\" found, unloading module");
        run_command(Command::new("rmmod").arg("-f").arg(&module))?;

        let control = self.pci_dir.join("power").join("control");
        info!("Forcing {} to always 'on'", control.display());
        std::fs::write(&control, "on")
            .with_context(|| format!("Cannot write {}", control.display()))?;
        Ok(())
    }

    /// Enable memory space access and bus mastering, disable INTx.
    ///
    /// # Errors
    ///
    /// Fails if the config file cannot be opened or written.
    pub fn enable_config(&self) -> Result<()> {
        let path = self.pci_dir.join("config");
        let mut config = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Cannot open {}", path.display()))?;
        config.seek(SeekFrom::Start(PCI_COMMAND))?;
        config
            .write_all(&PCI_COMMAND_VALUE)
            .with_context(|| format!("Cannot write PCI command register in {}", path.display()))?;
        Ok(())
    }
}

/// Mount hugetlbfs on `dir` unless it is already mounted there.
///
/// # Errors
///
/// Fails if `/proc/mounts` cannot be read or the mount fails.
pub fn ensure_hugetlbfs(dir: &Path) -> Result<()> {
    let mounts = std::fs::read_to_string("/proc/mounts").context("Cannot read /proc/mounts")?;
    if hugetlbfs_mounted(&mounts, dir) {
        return Ok(());
    }
    info!("Mounting hugetlbfs on {}", dir.display());
    std::fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
    run_command(
        Command::new("mount")
            .args(["-t", "hugetlbfs", "hugetlbfs"])
            .arg(dir),
    )
}

fn hugetlbfs_mounted(mounts: &str, dir: &Path) -> bool {
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace().skip(1);
        match (fields.next(), fields.next()) {
            (Some(target), Some("hugetlbfs")) => Path::new(&unescape_mount_field(target)) == dir,
            _ => false,
        }
    })
}

/// Undo the octal escapes (`\040` for a space) the kernel uses in
/// `/proc/mounts`.
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let code = rest
            .get(pos + 1..pos + 4)
            .filter(|c| c.bytes().all(|b| (b'0'..=b'7').contains(&b)));
        match code.and_then(|c| u8::from_str_radix(c, 8).ok()) {
            Some(byte) => {
                out.push(char::from(byte));
                rest = &rest[pos + 4..];
            }
            None => {
                out.push('\\');
                rest = &rest[pos + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn run_command(command: &mut Command) -> Result<()> {
    let status = command
        .status()
        .with_context(|| format!("Cannot run {command:?}"))?;
    if !status.success() {
        bail!("{command:?} failed with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_write_lands_at_command_register() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config"), [0xffu8; 64]).unwrap();
        DeviceSetup::new(dir.path()).run().unwrap();
        let config = std::fs::read(dir.path().join("config")).unwrap();
        assert_eq!(&config[4..6], &[0x06, 0x04]);
        assert_eq!(config[3], 0xff);
        assert_eq!(config[6], 0xff);
        assert_eq!(config.len(), 64);
    }

    #[test]
    fn readonly_keeps_driver() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("snd_hda_intel");
        std::fs::create_dir_all(&module).unwrap();
        std::fs::create_dir_all(dir.path().join("driver")).unwrap();
        std::os::unix::fs::symlink(&module, dir.path().join("driver").join("module")).unwrap();
        DeviceSetup::new(dir.path()).readonly(true).release_driver().unwrap();
        assert!(!dir.path().join("power").exists());
    }

    #[test]
    fn missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DeviceSetup::new(dir.path()).enable_config().is_err());
    }

    #[test]
    fn mount_table_parsing() {
        let mounts = "proc /proc proc rw 0 0\nhugetlbfs /dev/hugepages hugetlbfs rw,relatime 0 0\n";
        assert!(hugetlbfs_mounted(mounts, Path::new("/dev/hugepages")));
        assert!(hugetlbfs_mounted(mounts, Path::new("/dev/hugepages/")));
        assert!(!hugetlbfs_mounted("proc /proc proc rw 0 0\n", Path::new("/proc")));
    }

    #[test]
    fn hugetlbfs_elsewhere_does_not_count() {
        let mounts = "hugetlbfs /dev/hugepages hugetlbfs rw,relatime 0 0\n\
                      tmpfs /mnt/huge tmpfs rw 0 0\n";
        assert!(!hugetlbfs_mounted(mounts, Path::new("/mnt/huge")));
    }

    #[test]
    fn escaped_mount_points_match() {
        let mounts = "nodev /mnt/huge\\040pages hugetlbfs rw 0 0\n";
        assert!(hugetlbfs_mounted(mounts, Path::new("/mnt/huge pages")));
        assert_eq!(unescape_mount_field("a\\134b"), "a\\b");
        assert_eq!(unescape_mount_field("trailing\\"), "trailing\\");
    }
}
