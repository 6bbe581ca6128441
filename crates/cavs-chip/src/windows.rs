//! SRAM memory windows exposed through BAR4.
//!
//! Each window occupies a 128 KB slot starting at 512 KB:
//!
//! ```text
//! Window 0  0x80000   FW_STATUS word; IPC outbox 4 KB further in
//! Window 1  0xa0000   IPC inbox (host-writable)
//! Window 2  0xc0000   debug window
//! Window 3  0xe0000   winstream-formatted trace log
//! ```

const KB: usize = 1024;
const WINDOW_BASE: usize = 512 * KB;
const WINDOW_SLOT: usize = 128 * KB;

/// Byte offset of window `n` inside BAR4.
#[must_use]
pub const fn window_offset(n: usize) -> usize {
    WINDOW_BASE + n * WINDOW_SLOT
}

/// Firmware status word (window 0, offset 0).
pub const FW_STATUS_OFFSET: usize = window_offset(0);
/// DSP → host outbox.
pub const OUTBOX_OFFSET: usize = window_offset(0) + 4 * KB;
/// Host → DSP inbox.
pub const INBOX_OFFSET: usize = window_offset(1);
/// Debug window.
pub const DEBUG_OFFSET: usize = window_offset(2);
/// Trace (winstream) window.
pub const TRACE_OFFSET: usize = window_offset(3);
/// Size of one window slot.
pub const WINDOW_SIZE: usize = WINDOW_SLOT;

/// Firmware status codes reported in `SRAM_FW_STATUS`.
pub mod fw_status {
    /// ROM state value, in bits 24..31, meaning "ready for PURGE_FW".
    pub const ROM_READY: u32 = 5;
    /// Firmware state value, in bits 0..27, meaning "firmware entered".
    pub const FW_ENTERED: u32 = 5;
    /// Mask of the firmware state field.
    pub const STATE_MASK: u32 = (1 << 28) - 1;

    /// ROM state field.
    #[must_use]
    pub const fn rom_state(status: u32) -> u32 {
        status >> 24
    }

    /// True once the ROM is waiting for the firmware transfer.
    #[must_use]
    pub const fn rom_ready(status: u32) -> bool {
        rom_state(status) == ROM_READY
    }

    /// True once the loaded firmware has started.
    #[must_use]
    pub const fn fw_entered(status: u32) -> bool {
        status & STATE_MASK == FW_ENTERED
    }
}

/// Alternate "mtrace" layout: a 16-byte header at this offset inside the
/// selected window, followed by the data area.
pub mod mtrace {
    /// Header offset within the window.
    pub const HEADER_OFFSET: usize = 8192;
    /// Header length.
    pub const HEADER_LEN: usize = 16;
    /// Data area offset within the window.
    pub const DATA_OFFSET: usize = HEADER_OFFSET + HEADER_LEN;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_offsets() {
        assert_eq!(OUTBOX_OFFSET, 0x8_1000);
        assert_eq!(INBOX_OFFSET, 0xa_0000);
        assert_eq!(DEBUG_OFFSET, 0xc_0000);
        assert_eq!(TRACE_OFFSET, 0xe_0000);
        assert_eq!(FW_STATUS_OFFSET, crate::regs::SRAM_FW_STATUS);
    }

    #[test]
    fn status_decoding() {
        assert!(fw_status::rom_ready(0x0500_0000));
        assert!(!fw_status::fw_entered(0x0500_0000));
        assert!(fw_status::fw_entered(0x0000_0005));
        assert!(fw_status::fw_entered(0x5000_0005));
        assert!(!fw_status::rom_ready(0x0000_0005));
    }
}
