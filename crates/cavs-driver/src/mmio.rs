//! Memory-mapped I/O for the HD-Audio controller and DSP BARs
//!
//! Every register and memory-window access goes through [`MmioSpace`], so the
//! same register windows drive a real sysfs BAR mapping ([`BarMapping`]) or
//! the in-memory device in [`crate::sim`].
//!
//! Accesses take `&self`: the hardware serialises them, and callers order
//! them explicitly (each write is followed by its poll before the next one).

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{CavsError, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// A byte-addressable device memory region.
///
/// Out-of-range accesses are programming errors and panic.
pub trait MmioSpace: Send + Sync + std::fmt::Debug {
    /// Size of the region in bytes.
    fn len(&self) -> usize;

    /// True for a zero-length region.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Volatile 32-bit load.
    fn read32(&self, offset: usize) -> u32;

    /// Volatile 32-bit store.
    fn write32(&self, offset: usize, value: u32);

    /// Copy `buf.len()` bytes out of the region, one volatile access per byte.
    fn read_bytes(&self, offset: usize, buf: &mut [u8]);

    /// Copy `data` into the region, one volatile access per byte.
    fn write_bytes(&self, offset: usize, data: &[u8]);
}

/// Panic unless `[offset, offset + len)` lies inside a region of `limit` bytes.
pub(crate) fn check_bounds(offset: usize, len: usize, limit: usize) {
    assert!(
        offset.checked_add(len).is_some_and(|end| end <= limit),
        "MMIO access out of bounds: offset={offset:#x} len={len} limit={limit:#x}"
    );
}

/// A PCI BAR mapped from its sysfs `resourceN` file
#[derive(Debug)]
pub struct BarMapping {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    path: PathBuf,
}

impl BarMapping {
    /// Map BAR `index` of the PCI device whose sysfs directory is `pci_dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the resource file is missing, empty or cannot be
    /// mapped read/write.
    pub fn open(pci_dir: &Path, index: usize) -> Result<Self> {
        let path = pci_dir.join(format!("resource{index}"));
        if !path.exists() {
            return Err(CavsError::device_not_found(&path));
        }

        tracing::debug!("Mapping PCI BAR: {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CavsError::mapping(format!("Cannot open {}: {e}", path.display())))?;

        let size = usize::try_from(file.metadata()?.len())
            .map_err(|_| CavsError::mapping("BAR larger than the address space"))?;
        if size == 0 {
            return Err(CavsError::mapping(format!(
                "{} has size 0 (memory space disabled?)",
                path.display()
            )));
        }

        // SAFETY: mmap of a sysfs PCI resource file.
        // - The file descriptor was just opened read/write and is kept alive in `_file`
        // - size is non-zero and equals the resource length reported by the kernel
        // - MAP_SHARED so stores reach the device rather than a private copy
        // - The mapping is unmapped exactly once, in Drop
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| CavsError::mapping(format!("mmap {} failed: {e}", path.display())))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| CavsError::mapping("mmap returned a null mapping"))?;

        tracing::info!("Mapped PCI BAR {index} of length {size} bytes at {ptr:p}");

        Ok(Self {
            ptr,
            size,
            _file: file,
            path,
        })
    }

    /// Resource file backing this mapping
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MmioSpace for BarMapping {
    fn len(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> u32 {
        check_bounds(offset, 4, self.size);
        // SAFETY: Volatile read from a mapped device register.
        // - Bounds checked above: offset + 4 <= self.size
        // - ptr is valid for self.size bytes for the lifetime of self
        // - Register offsets are dword aligned and the mapping is page aligned
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };
        tracing::trace!("read32 {offset:#x} = {value:#x}");
        value
    }

    fn write32(&self, offset: usize, value: u32) {
        check_bounds(offset, 4, self.size);
        tracing::trace!("write32 {offset:#x} = {value:#x}");
        // SAFETY: Volatile write to a mapped device register.
        // - Bounds checked above: offset + 4 <= self.size
        // - ptr is valid for self.size bytes for the lifetime of self
        // - Register offsets are dword aligned and the mapping is page aligned
        unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value) }
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        check_bounds(offset, buf.len(), self.size);
        let base = self.ptr.as_ptr();
        for (i, byte) in buf.iter_mut().enumerate() {
            // SAFETY: offset + i < offset + buf.len() <= self.size (checked above);
            // byte accesses have no alignment requirement.
            *byte = unsafe { base.add(offset + i).read_volatile() };
        }
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) {
        check_bounds(offset, data.len(), self.size);
        let base = self.ptr.as_ptr();
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: offset + i < offset + data.len() <= self.size (checked above);
            // byte accesses have no alignment requirement.
            unsafe { base.add(offset + i).write_volatile(*byte) };
        }
    }
}

impl Drop for BarMapping {
    fn drop(&mut self) {
        tracing::debug!("Unmapping {}", self.path.display());
        // SAFETY: ptr and size are exactly what mmap returned in open(), and
        // Drop runs once; no references into the mapping outlive self.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            tracing::error!("munmap failed during drop: {e}");
        }
    }
}

// SAFETY: BarMapping owns its mapping exclusively. The pointer stays valid
// wherever the value moves, since mmap'd memory is process-wide.
unsafe impl Send for BarMapping {}

// SAFETY: All accesses are bounds-checked single volatile loads/stores; the
// device, not Rust, defines what concurrent accesses mean. ptr, size and the
// backing file are never mutated after open().
unsafe impl Sync for BarMapping {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_accepts_exact_fit() {
        check_bounds(0x0c, 4, 0x10);
        check_bounds(0x10, 0, 0x10);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn bounds_rejects_overrun() {
        check_bounds(0x0d, 4, 0x10);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn bounds_rejects_wrapping_offset() {
        check_bounds(usize::MAX - 1, 4, 0x10);
    }

    #[test]
    fn missing_resource_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = BarMapping::open(dir.path(), 4).unwrap_err();
        assert!(matches!(err, CavsError::DeviceNotFound { .. }));
    }

    #[test]
    fn empty_resource_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("resource0"), b"").unwrap();
        let err = BarMapping::open(dir.path(), 0).unwrap_err();
        assert!(matches!(err, CavsError::Mapping { .. }));
    }

    #[test]
    fn regular_file_maps_like_a_bar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("resource4"), vec![0u8; 4096]).unwrap();
        let bar = BarMapping::open(dir.path(), 4).unwrap();
        assert_eq!(bar.len(), 4096);
        bar.write32(0x80, 0xdead_beef);
        assert_eq!(bar.read32(0x80), 0xdead_beef);
        let mut out = [0u8; 4];
        bar.read_bytes(0x80, &mut out);
        assert_eq!(out, 0xdead_beef_u32.to_ne_bytes());
    }
}
