//! Register maps for the HD-Audio controller (BAR0) and the DSP (BAR4).
//!
//! All registers here are accessed as naturally aligned 32-bit words. Fields
//! that the HD-Audio spec defines as 8- or 16-bit (stream `STS`, `FIFOW`,
//! `FMT`) are extracted from the enclosing dword instead of being read at an
//! unaligned offset.
//!
//! ```text
//! BAR0  0x0000  GCAP      global capabilities (ISS in bits 8..11)
//!       0x0008  GCTL      global control (CRST bit 0)
//!       0x0070  DPLBASE / 0x0074 DPUBASE   DMA position buffer
//!       0x0080  SD0 ...   stream descriptors, 0x20 apart
//!       0x0700  SPBFCH / 0x0704 SPBFCTL    software position in buffer
//!       0x0708  SPIB[n]   8 bytes apart
//!       0x0800  PPCH / 0x0804 PPCTL / 0x0808 PPSTS   processing pipe
//! BAR4  0x0004  ADSPCS    DSP core power / reset / stall
//!       0x00c0+ HIPC*     doorbells (0x40+ on cAVS 1.5)
//!       0x80000 SRAM window 0, first word is FW_STATUS
//! ```

use crate::pcie::ChipGeneration;

// ── HD-Audio generic registers (BAR0) ───────────────────────────────────────

/// Global capabilities.
pub const GCAP: usize = 0x0000;
/// Global control.
pub const GCTL: usize = 0x0008;
/// DMA position buffer lower base.
pub const DPLBASE: usize = 0x0070;
/// DMA position buffer upper base.
pub const DPUBASE: usize = 0x0074;
/// Software position in buffer capability header.
pub const SPBFCH: usize = 0x0700;
/// Software position in buffer control (one enable bit per stream).
pub const SPBFCTL: usize = 0x0704;
/// Processing pipe capability header.
pub const PPCH: usize = 0x0800;
/// Processing pipe control.
pub const PPCTL: usize = 0x0804;
/// Processing pipe status.
pub const PPSTS: usize = 0x0808;

/// Base of the per-stream SPIB registers.
pub const SPIB_BASE: usize = 0x0708;
/// Stride between SPIB registers.
pub const SPIB_STRIDE: usize = 0x08;

/// SPIB register for `stream`.
#[must_use]
pub const fn spib(stream: u8) -> usize {
    SPIB_BASE + SPIB_STRIDE * stream as usize
}

/// `GCTL` bits.
pub mod gctl {
    /// Controller reset (0 = in reset).
    pub const CRST: u32 = 1 << 0;
}

/// `GCAP` decoding.
pub mod gcap {
    /// Number of input streams ("ISS"), which is also the index of the
    /// first output stream.
    #[must_use]
    pub const fn input_streams(gcap: u32) -> u8 {
        ((gcap >> 8) & 0x0f) as u8
    }
}

/// `SPBFCTL` bits.
pub mod spbfctl {
    /// Per-stream SPIB enable.
    ///
    /// # Panics
    ///
    /// Panics if `stream` exceeds [`super::MAX_STREAM_ID`].
    #[must_use]
    pub const fn spib_enable(stream: u8) -> u32 {
        assert!(stream <= super::MAX_STREAM_ID, "stream id out of range");
        1 << stream
    }
}

/// `PPCTL` bits.
pub mod ppctl {
    /// Global processing enable. Also gates access to the BAR4 registers.
    pub const GPROCEN: u32 = 1 << 30;

    /// Per-stream processing enable.
    ///
    /// # Panics
    ///
    /// Panics if `stream` exceeds [`super::MAX_STREAM_ID`].
    #[must_use]
    pub const fn procen(stream: u8) -> u32 {
        assert!(stream <= super::MAX_STREAM_ID, "stream id out of range");
        1 << stream
    }
}

// ── Stream descriptors (BAR0) ───────────────────────────────────────────────

/// Base of stream descriptor 0.
pub const SD_BASE: usize = 0x0080;
/// Stride between stream descriptors.
pub const SD_STRIDE: usize = 0x20;
/// Base of the stream debug block (DPIB/EFIFOS), offset 4 into each descriptor slot.
pub const SD_DEBUG_BASE: usize = 0x0084;

/// Highest stream id whose registers all stay inside their blocks. SPIB slot
/// 31 would land on PPCH, and PPCTL holds one enable bit per stream below
/// GPROCEN (bit 30) in a 32-bit word.
pub const MAX_STREAM_ID: u8 = {
    let spib_limit = (PPCH - SPIB_BASE) / SPIB_STRIDE - 1;
    let mask_limit = if ppctl::GPROCEN.trailing_zeros() < u32::BITS {
        ppctl::GPROCEN.trailing_zeros() as usize - 1
    } else {
        u32::BITS as usize - 1
    };
    let limit = if spib_limit < mask_limit { spib_limit } else { mask_limit };
    limit as u8
};

/// Byte offset of the descriptor block for `stream`.
#[must_use]
pub const fn stream_base(stream: u8) -> usize {
    SD_BASE + SD_STRIDE * stream as usize
}

/// Byte offset of the debug block for `stream`.
#[must_use]
pub const fn stream_debug_base(stream: u8) -> usize {
    SD_DEBUG_BASE + SD_STRIDE * stream as usize
}

/// Dword offsets inside one stream descriptor.
pub mod sd {
    /// Control (bits 0..23) + status (bits 24..31).
    pub const CTL: usize = 0x00;
    /// Link position in buffer.
    pub const LPIB: usize = 0x04;
    /// Cyclic buffer length.
    pub const CBL: usize = 0x08;
    /// Last valid index (bits 0..15) + FIFO watermark (bits 16..31).
    pub const LVI: usize = 0x0c;
    /// FIFO size (bits 0..15) + format (bits 16..31).
    pub const FIFOS: usize = 0x10;
    /// FIFO limit.
    pub const FIFOL: usize = 0x14;
    /// Buffer descriptor list pointer, lower.
    pub const BDPL: usize = 0x18;
    /// Buffer descriptor list pointer, upper.
    pub const BDPU: usize = 0x1c;

    /// Debug block: DMA position in buffer.
    pub const DPIB: usize = 0x00;
    /// Debug block: enhanced FIFO size.
    pub const EFIFOS: usize = 0x10;
}

/// Stream `CTL` bits.
pub mod ctl {
    /// Stream reset. Reads back 1 once the engine has entered reset.
    pub const SRST: u32 = 1 << 0;
    /// Stream run (DMA START).
    pub const RUN: u32 = 1 << 1;
    /// Traffic priority.
    pub const TP: u32 = 1 << 18;
    /// Shift of the 4-bit stream tag.
    pub const STRM_SHIFT: u32 = 20;

    /// Stream tag field for `tag`.
    #[must_use]
    pub const fn stream_tag(tag: u8) -> u32 {
        (tag as u32 & 0xff) << STRM_SHIFT
    }

    /// Status byte (the `STS` register at descriptor offset 3).
    #[must_use]
    pub const fn status(ctl: u32) -> u8 {
        (ctl >> 24) as u8
    }
}

/// Stream `STS` bits (within [`ctl::status`]).
pub mod sts {
    /// Buffer completion interrupt status.
    pub const BCIS: u8 = 1 << 2;
    /// FIFO error.
    pub const FIFOE: u8 = 1 << 3;
    /// Descriptor error.
    pub const DESE: u8 = 1 << 4;
    /// FIFO ready.
    pub const FIFORDY: u8 = 1 << 5;
}

// ── DSP registers (BAR4) ────────────────────────────────────────────────────

/// DSP core control and status.
pub const ADSPCS: usize = 0x0_0004;

/// Start of SRAM window 0; its first word is the firmware status.
pub const SRAM_FW_STATUS: usize = 0x8_0000;

/// `ADSPCS` field shifts. Each field holds one bit per core.
pub mod adspcs {
    /// Core reset.
    pub const CRST: u32 = 0;
    /// Core stall.
    pub const CSTALL: u32 = 8;
    /// Set power active (host request).
    pub const SPA: u32 = 16;
    /// Current power active (hardware acknowledge).
    pub const CPA: u32 = 24;

    /// Core 0 reset bit, polled alone when leaving reset.
    pub const CORE0_CRST: u32 = 1 << CRST;
}

/// IPC register offsets, which moved between cAVS 1.5 and 1.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DspLayout {
    /// DSP → host doorbell (target request).
    pub hipctdr: usize,
    /// DSP → host done acknowledge. Absent on 1.5.
    pub hipctda: Option<usize>,
    /// DSP → host payload.
    pub hipctdd: usize,
    /// Host → DSP doorbell (initiator request).
    pub hipcidr: usize,
    /// Host → DSP done acknowledge. Absent on 1.5.
    pub hipcida: Option<usize>,
    /// Host → DSP payload.
    pub hipcidd: usize,
}

impl DspLayout {
    /// Register layout for a hardware generation.
    #[must_use]
    pub const fn for_generation(generation: ChipGeneration) -> Self {
        match generation {
            ChipGeneration::Cavs15 => Self {
                hipctdr: 0x40,
                hipctda: None,
                hipctdd: 0x44,
                hipcidr: 0x48,
                hipcida: None,
                hipcidd: 0x4c,
            },
            ChipGeneration::Cavs18 | ChipGeneration::Cavs25 => Self {
                hipctdr: 0xc0,
                hipctda: Some(0xc4),
                hipctdd: 0xc8,
                hipcidr: 0xd0,
                hipcida: Some(0xd4),
                hipcidd: 0xd8,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_blocks_are_disjoint_from_spib() {
        assert_eq!(stream_base(0), 0x80);
        assert_eq!(stream_base(5), 0x80 + 5 * 0x20);
        assert!(stream_base(MAX_STREAM_ID) + SD_STRIDE <= SPBFCH);
        assert_eq!(spib(3), 0x0708 + 3 * 8);
    }

    #[test]
    fn highest_stream_stays_inside_spib_and_masks() {
        assert_eq!(MAX_STREAM_ID, 29);
        assert!(spib(MAX_STREAM_ID) + 4 <= PPCH);
        assert_eq!(spib(31), PPCH);
        assert!(u32::from(MAX_STREAM_ID) < u32::BITS);
        assert_eq!(ppctl::procen(MAX_STREAM_ID) & ppctl::GPROCEN, 0);
        assert_eq!(spbfctl::spib_enable(MAX_STREAM_ID), 1 << 29);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn procen_rejects_ids_past_the_mask() {
        let _ = ppctl::procen(MAX_STREAM_ID + 1);
    }

    #[test]
    fn ctl_fields() {
        assert_eq!(ctl::stream_tag(1), 1 << 20);
        assert_eq!(ctl::status(0x2000_0000), sts::FIFORDY);
        assert_eq!(gcap::input_streams(0x0000_0700), 7);
    }

    #[test]
    fn layout_moves_on_cavs18() {
        let old = DspLayout::for_generation(ChipGeneration::Cavs15);
        let new = DspLayout::for_generation(ChipGeneration::Cavs18);
        assert_eq!(old.hipcidr, 0x48);
        assert_eq!(new.hipcidr, 0xd0);
        assert!(old.hipctda.is_none());
        assert_eq!(new.hipctda, Some(0xc4));
        assert_eq!(DspLayout::for_generation(ChipGeneration::Cavs25), new);
    }
}
