//! Buffer descriptor lists.
//!
//! An HD-Audio stream reads its buffer layout from a table of 16-byte
//! entries in host memory:
//!
//! ```text
//! 0..8    u64 LE  physical address of the buffer
//! 8..16   u64 LE  length (low 32 bits) + IOC flag (bit 32), IOC unused here
//! ```
//!
//! The controller requires at least two entries even when the data is one
//! contiguous region, and every buffer must be a multiple of 128 bytes.

use crate::HUGEPAGE_SIZE;

/// Size of one encoded entry.
pub const ENTRY_SIZE: usize = 16;

/// Minimum number of entries the controller accepts.
pub const MIN_ENTRIES: usize = 2;

/// Minimum buffer size and alignment; also the record size of a stream print.
pub const MIN_BUFFER: usize = 128;

/// One `(address, length)` descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdlEntry {
    /// Physical address.
    pub address: u64,
    /// Length in bytes.
    pub length: u64,
}

impl BdlEntry {
    /// Encoded little-endian form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[..8].copy_from_slice(&self.address.to_le_bytes());
        out[8..].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// A descriptor list plus where it lives inside its DMA page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptorList {
    entries: Vec<BdlEntry>,
    /// Offset of the encoded list inside the page.
    pub list_offset: usize,
}

impl BufferDescriptorList {
    /// Two mirrored halves of `buf_len` bytes starting at `phys`, list placed
    /// right after them at `2 * buf_len`.
    #[must_use]
    pub fn double_buffer(phys: u64, buf_len: usize) -> Self {
        let len = buf_len as u64;
        Self {
            entries: vec![
                BdlEntry { address: phys, length: len },
                BdlEntry { address: phys + len, length: len },
            ],
            list_offset: 2 * buf_len,
        }
    }

    /// Firmware transfer layout: one main buffer covering the page minus
    /// 256 bytes, a vestigial 128-byte buffer, and the list in the final
    /// 128 bytes.
    #[must_use]
    pub fn firmware(phys: u64) -> Self {
        let main = FIRMWARE_MAX_LEN;
        Self {
            entries: vec![
                BdlEntry { address: phys, length: main as u64 },
                BdlEntry {
                    address: phys + main as u64,
                    length: MIN_BUFFER as u64,
                },
            ],
            list_offset: main + MIN_BUFFER,
        }
    }

    /// Descriptor entries.
    #[must_use]
    pub fn entries(&self) -> &[BdlEntry] {
        &self.entries
    }

    /// Value for the stream's LVI register.
    #[must_use]
    pub fn last_valid_index(&self) -> u32 {
        u32::try_from(self.entries.len() - 1).unwrap_or(u32::MAX)
    }

    /// Sum of all buffer lengths.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.entries.iter().map(|e| e.length).sum()
    }

    /// Encoded list.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.entries.iter().flat_map(|e| e.to_bytes()).collect()
    }

    /// Bytes of page needed from `list_offset` onward.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.entries.len() * ENTRY_SIZE
    }

    /// Physical address of the list itself, for BDPL/BDPU.
    #[must_use]
    pub fn list_address(&self, page_phys: u64) -> u64 {
        page_phys + self.list_offset as u64
    }
}

/// Largest firmware image the single-page transfer layout can carry.
pub const FIRMWARE_MAX_LEN: usize = HUGEPAGE_SIZE - 2 * MIN_BUFFER;

/// Largest `buf_len` whose mirrored halves and list fit in one page.
pub const DOUBLE_BUFFER_MAX_LEN: usize = (HUGEPAGE_SIZE - MIN_ENTRIES * ENTRY_SIZE) / 2;
