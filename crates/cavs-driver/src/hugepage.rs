//! Physically contiguous DMA buffers
//!
//! The HD-Audio DMA engine addresses host memory physically and there is no
//! IOMMU mapping in this path, so every buffer is one 2 MiB huge page whose
//! physical address is looked up once in `/proc/self/pagemap`:
//!
//! ```text
//! hugetlbfs file ── truncate(2M) ── mmap(SHARED) ── unlink ── touch byte 0
//!                                                                  │
//!        phys = (pagemap[vaddr / 4K] & (2^55 - 1)) * 4K  ◄─────────┘
//! ```
//!
//! Hugetlb pages are never swapped or migrated, so the address stays valid
//! until the mapping is dropped. The backing file is unlinked immediately so
//! a crash leaves nothing behind.
//!
//! Reading pagemap frame numbers requires `CAP_SYS_ADMIN`; without it the
//! kernel reports frame 0 and allocation fails.

use crate::error::{CavsError, Result};
use cavs_chip::{HUGEPAGE_SIZE, PAGE_SIZE};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::alloc::Layout;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Environment variable overriding the hugetlbfs mount point.
pub const HUGEPAGE_DIR_ENV: &str = "CAVS_HUGEPAGE_DIR";

/// Default hugetlbfs mount point.
pub const DEFAULT_HUGEPAGE_DIR: &str = "/dev/hugepages";

const PFN_MASK: u64 = (1 << 55) - 1;

/// Source of DMA-capable buffers.
pub trait DmaAllocator: Send + Sync + std::fmt::Debug {
    /// Allocate one granule able to hold at least `len` bytes.
    ///
    /// # Errors
    ///
    /// Fails if `len` exceeds one granule or the OS cannot provide memory
    /// with a known physical address.
    fn allocate(&self, len: usize) -> Result<PhysicalBuffer>;
}

enum Backing {
    Mapped,
    Heap { layout: Layout, live: Arc<AtomicUsize> },
}

/// An owned buffer with a fixed physical address.
///
/// Released exactly once, when dropped.
pub struct PhysicalBuffer {
    ptr: NonNull<u8>,
    len: usize,
    phys: u64,
    backing: Backing,
}

impl std::fmt::Debug for PhysicalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalBuffer")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("len", &self.len)
            .field("phys", &format_args!("{:#x}", self.phys))
            .finish_non_exhaustive()
    }
}

// SAFETY: The buffer exclusively owns its memory; the pointer is valid from
// any thread for the buffer's lifetime.
unsafe impl Send for PhysicalBuffer {}

// SAFETY: Shared access only copies bytes out; mutation requires &mut self.
unsafe impl Sync for PhysicalBuffer {}

impl PhysicalBuffer {
    /// Physical address of byte 0.
    #[must_use]
    pub const fn phys(&self) -> u64 {
        self.phys
    }

    /// Buffer size in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length buffer (never produced by the allocators).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the end of the buffer.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        crate::mmio::check_bounds(offset, data.len(), self.len);
        // SAFETY: Range checked above; src is a caller slice and dst is our
        // exclusively owned buffer, so they cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the end of the buffer.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        crate::mmio::check_bounds(offset, buf.len(), self.len);
        // SAFETY: Range checked above; dst is a caller slice distinct from
        // our buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Zero `len` bytes starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the end of the buffer.
    pub fn zero(&mut self, offset: usize, len: usize) {
        crate::mmio::check_bounds(offset, len, self.len);
        // SAFETY: Range checked above; we own the buffer exclusively.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr().add(offset), 0, len) };
    }
}

impl Drop for PhysicalBuffer {
    fn drop(&mut self) {
        match &self.backing {
            Backing::Mapped => {
                // SAFETY: ptr/len are exactly what mmap returned; Drop runs once.
                if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) } {
                    tracing::error!("munmap of DMA page {:#x} failed: {e}", self.phys);
                }
            }
            Backing::Heap { layout, live } => {
                // SAFETY: ptr was returned by alloc_zeroed with this layout.
                unsafe { std::alloc::dealloc(self.ptr.as_ptr(), *layout) };
                live.fetch_sub(1, Ordering::Relaxed);
            }
        }
        debug!("Released DMA buffer at {:#x}", self.phys);
    }
}

/// Huge pages from a hugetlbfs mount, with real physical addresses
#[derive(Debug)]
pub struct HugePageAllocator {
    dir: PathBuf,
    next_id: AtomicU32,
}

impl HugePageAllocator {
    /// Allocate from the hugetlbfs mounted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next_id: AtomicU32::new(0),
        }
    }

    /// Allocate from `$CAVS_HUGEPAGE_DIR`, or `/dev/hugepages`.
    pub fn from_env() -> Self {
        let dir = std::env::var_os(HUGEPAGE_DIR_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_HUGEPAGE_DIR), PathBuf::from);
        Self::new(dir)
    }

    /// Mount point in use.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ask the kernel for one more huge page if none are free. Best effort:
    /// failure shows up later as an mmap error.
    fn ensure_budget() {
        let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
            return;
        };
        if meminfo_value(&meminfo, "HugePages_Free") != Some(0) {
            return;
        }
        let total = meminfo_value(&meminfo, "HugePages_Total").unwrap_or(0);
        info!("No free huge pages, raising nr_hugepages to {}", total + 1);
        if let Err(e) = std::fs::write("/proc/sys/vm/nr_hugepages", format!("{}\n", total + 1)) {
            warn!("Cannot raise nr_hugepages: {e}");
        }
    }

    fn map_page(&self) -> Result<PhysicalBuffer> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("cavs-fw-dma.tmp.{}.{id}", std::process::id()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| CavsError::huge_page(format!("Cannot create {}: {e}", path.display())))?;
        let mapped = Self::map_file(&file, &path);
        // The mapping keeps the page alive; the name is no longer needed.
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Cannot unlink {}: {e}", path.display());
        }
        let mut buffer = mapped?;

        // Fault the page in so it has a frame number.
        buffer.zero(0, 1);
        buffer.phys = resolve_phys(buffer.ptr.as_ptr() as usize)?;

        info!("Mapped 2M huge page at {:#x}", buffer.phys);
        Ok(buffer)
    }

    fn map_file(file: &File, path: &Path) -> Result<PhysicalBuffer> {
        file.set_len(HUGEPAGE_SIZE as u64)
            .map_err(|e| CavsError::huge_page(format!("Cannot size {}: {e}", path.display())))?;

        // SAFETY: Fresh hugetlbfs file of exactly HUGEPAGE_SIZE bytes, mapped
        // shared read/write. The returned PhysicalBuffer owns the mapping and
        // unmaps it exactly once; the mapping outlives the file descriptor.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                HUGEPAGE_SIZE,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| CavsError::huge_page(format!("mmap {} failed: {e}", path.display())))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| CavsError::huge_page("mmap returned a null mapping"))?;
        Ok(PhysicalBuffer {
            ptr,
            len: HUGEPAGE_SIZE,
            phys: 0,
            backing: Backing::Mapped,
        })
    }
}

impl DmaAllocator for HugePageAllocator {
    fn allocate(&self, len: usize) -> Result<PhysicalBuffer> {
        check_granule(len)?;
        Self::ensure_budget();
        self.map_page()
    }
}

/// Zeroed heap pages with made-up physical addresses, for simulation
#[derive(Debug)]
pub struct HeapAllocator {
    next_phys: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self {
            next_phys: AtomicU64::new(0x1_0000_0000),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl HeapAllocator {
    /// New allocator; fake addresses start at 4 GiB so both BDL halves are
    /// exercised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers handed out and not yet dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl DmaAllocator for HeapAllocator {
    fn allocate(&self, len: usize) -> Result<PhysicalBuffer> {
        check_granule(len)?;
        let layout = Layout::from_size_align(HUGEPAGE_SIZE, PAGE_SIZE)
            .map_err(|e| CavsError::huge_page(format!("Invalid layout: {e}")))?;
        // SAFETY: layout has non-zero size; the pointer is released with the
        // same layout in PhysicalBuffer::drop.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| CavsError::huge_page("Out of memory"))?;
        let phys = self.next_phys.fetch_add(HUGEPAGE_SIZE as u64, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(PhysicalBuffer {
            ptr,
            len: HUGEPAGE_SIZE,
            phys,
            backing: Backing::Heap {
                layout,
                live: Arc::clone(&self.live),
            },
        })
    }
}

fn check_granule(len: usize) -> Result<()> {
    if len > HUGEPAGE_SIZE {
        return Err(CavsError::huge_page(format!(
            "{len} bytes requested, one granule holds {HUGEPAGE_SIZE}"
        )));
    }
    Ok(())
}

/// Value of a `Key:   N` line in `/proc/meminfo` format.
fn meminfo_value(meminfo: &str, key: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// Physical address for a pagemap entry and the in-page offset.
fn pagemap_phys(entry: u64, page_offset: u64) -> Option<u64> {
    let pfn = entry & PFN_MASK;
    (pfn != 0).then(|| pfn * PAGE_SIZE as u64 + page_offset)
}

fn resolve_phys(vaddr: usize) -> Result<u64> {
    let pagemap = File::open("/proc/self/pagemap")
        .map_err(|e| CavsError::huge_page(format!("Cannot open pagemap: {e}")))?;
    let mut entry = [0u8; 8];
    pagemap
        .read_exact_at(&mut entry, (vaddr / PAGE_SIZE * 8) as u64)
        .map_err(|e| CavsError::huge_page(format!("Cannot read pagemap: {e}")))?;
    pagemap_phys(u64::from_le_bytes(entry), (vaddr % PAGE_SIZE) as u64).ok_or_else(|| {
        CavsError::huge_page("pagemap reports no frame number (needs CAP_SYS_ADMIN)")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_parsing() {
        let text = "MemTotal:       16318396 kB\nHugePages_Total:       2\nHugePages_Free:        0\n";
        assert_eq!(meminfo_value(text, "HugePages_Total"), Some(2));
        assert_eq!(meminfo_value(text, "HugePages_Free"), Some(0));
        assert_eq!(meminfo_value(text, "HugePages_Rsvd"), None);
    }

    #[test]
    fn pagemap_entry_decoding() {
        // present bit (63) and soft-dirty (55) are not part of the frame number
        let entry = (1u64 << 63) | (1 << 55) | 0x12_3456;
        assert_eq!(pagemap_phys(entry, 0), Some(0x12_3456 * 4096));
        assert_eq!(pagemap_phys(1 << 63, 0), None);
    }

    #[test]
    fn heap_buffers_are_released_once() {
        let alloc = HeapAllocator::new();
        let mut a = alloc.allocate(4096).unwrap();
        let b = alloc.allocate(HUGEPAGE_SIZE).unwrap();
        assert_eq!(alloc.live(), 2);
        assert_eq!(b.phys() - a.phys(), HUGEPAGE_SIZE as u64);

        a.write_at(10, b"abc");
        let mut out = [0u8; 3];
        a.read_at(10, &mut out);
        assert_eq!(&out, b"abc");

        drop(a);
        drop(b);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn oversized_request_rejected() {
        let err = HeapAllocator::new().allocate(HUGEPAGE_SIZE + 1).unwrap_err();
        assert!(matches!(err, CavsError::HugePage { .. }));
    }

    #[test]
    fn env_override_picks_directory() {
        let alloc = HugePageAllocator::new("/mnt/huge");
        assert_eq!(alloc.dir(), Path::new("/mnt/huge"));
    }

    #[test]
    #[ignore] // Requires hugetlbfs and CAP_SYS_ADMIN
    fn real_huge_page_has_physical_address() {
        let alloc = HugePageAllocator::from_env();
        let page = alloc.allocate(HUGEPAGE_SIZE).unwrap();
        assert_ne!(page.phys(), 0);
        assert_eq!(page.phys() % HUGEPAGE_SIZE as u64, 0);
    }
}
