//! Named register windows
//!
//! A window is a base offset into an [`MmioSpace`] plus a fixed set of named
//! 32-bit fields. Fields are declared on a [`WindowBuilder`] and sealed with
//! [`WindowBuilder::freeze`]; only the frozen [`RegisterWindow`] can touch
//! hardware, so "access before freeze" and "declare after freeze" cannot be
//! written.
//!
//! ```text
//! WindowBuilder::new(space, base)
//!     .declare(Field::A, 0x00)      panics on a duplicate name or offset
//!     .declare(Field::B, 0x04)
//!     .freeze()?                    fails if a field runs past the mapping
//!     .read(Field::A)               one volatile load at base + 0x00
//! ```
//!
//! The constructors at the bottom build the windows the tool uses: generic
//! HD-Audio registers, one stream descriptor, one stream debug block, and the
//! DSP control block for a given chip generation.

use crate::error::{CavsError, Result};
use crate::mmio::MmioSpace;
use cavs_chip::regs::{self as chip, DspLayout};
use std::fmt::Debug;
use std::sync::Arc;

/// Builder for a [`RegisterWindow`].
#[derive(Debug)]
pub struct WindowBuilder<F> {
    space: Arc<dyn MmioSpace>,
    base: usize,
    fields: Vec<(F, usize)>,
}

impl<F: Copy + Eq + Debug> WindowBuilder<F> {
    /// Start a window at `base` inside `space`.
    pub fn new(space: Arc<dyn MmioSpace>, base: usize) -> Self {
        Self {
            space,
            base,
            fields: Vec::new(),
        }
    }

    /// Declare `field` at byte `offset` from the window base.
    ///
    /// # Panics
    ///
    /// Panics if the field is already declared, if another field already
    /// uses the offset, or if the offset is not dword aligned.
    #[must_use]
    pub fn declare(mut self, field: F, offset: usize) -> Self {
        assert!(offset % 4 == 0, "{field:?} at {offset:#x} is not dword aligned");
        for &(existing, existing_offset) in &self.fields {
            assert!(existing != field, "{field:?} declared twice");
            assert!(
                existing_offset != offset,
                "{field:?} aliases {existing:?} at offset {offset:#x}"
            );
        }
        self.fields.push((field, offset));
        self
    }

    /// Seal the layout.
    ///
    /// # Errors
    ///
    /// Returns [`CavsError::RegisterLayout`] if any field lies outside the
    /// mapping.
    pub fn freeze(self) -> Result<RegisterWindow<F>> {
        let limit = self.space.len();
        for &(field, offset) in &self.fields {
            let end = self.base.checked_add(offset).and_then(|o| o.checked_add(4));
            if end.map_or(true, |end| end > limit) {
                return Err(CavsError::register_layout(format!(
                    "{field:?} at {:#x} + {offset:#x} exceeds mapping of {limit:#x} bytes",
                    self.base
                )));
            }
        }
        Ok(RegisterWindow {
            space: self.space,
            base: self.base,
            fields: self.fields.into(),
        })
    }
}

/// A frozen set of named registers.
///
/// Cloning shares the mapping and the layout; it does not copy registers.
#[derive(Debug, Clone)]
pub struct RegisterWindow<F> {
    space: Arc<dyn MmioSpace>,
    base: usize,
    fields: Arc<[(F, usize)]>,
}

impl<F: Copy + Eq + Debug> RegisterWindow<F> {
    /// Base offset of the window inside its mapping.
    pub fn base(&self) -> usize {
        self.base
    }

    /// True if `field` was declared.
    pub fn has(&self, field: F) -> bool {
        self.fields.iter().any(|&(f, _)| f == field)
    }

    /// Absolute offset of `field` inside the mapping.
    ///
    /// # Panics
    ///
    /// Panics if `field` was never declared.
    pub fn offset(&self, field: F) -> usize {
        self.fields
            .iter()
            .find(|&&(f, _)| f == field)
            .map(|&(_, offset)| self.base + offset)
            .unwrap_or_else(|| panic!("register {field:?} not declared in this window"))
    }

    /// Read `field`.
    pub fn read(&self, field: F) -> u32 {
        self.space.read32(self.offset(field))
    }

    /// Write `field`.
    pub fn write(&self, field: F, value: u32) {
        self.space.write32(self.offset(field), value);
    }

    /// Read-modify-write `field`.
    pub fn update(&self, field: F, f: impl FnOnce(u32) -> u32) {
        let offset = self.offset(field);
        let value = f(self.space.read32(offset));
        self.space.write32(offset, value);
    }

    /// `field |= bits`
    pub fn set_bits(&self, field: F, bits: u32) {
        self.update(field, |v| v | bits);
    }

    /// `field &= !bits`
    pub fn clear_bits(&self, field: F, bits: u32) {
        self.update(field, |v| v & !bits);
    }
}

/// Generic HD-Audio controller registers (BAR0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdaReg {
    /// Global capabilities
    Gcap,
    /// Global control
    Gctl,
    /// DMA position buffer lower base
    Dplbase,
    /// DMA position buffer upper base
    Dpubase,
    /// SPIB capability header
    Spbfch,
    /// SPIB enable bits
    Spbfctl,
    /// Processing pipe capability header
    Ppch,
    /// Processing pipe control
    Ppctl,
    /// Processing pipe status
    Ppsts,
}

/// Build the HD-Audio register window over BAR0.
///
/// # Errors
///
/// Fails if BAR0 is too small to hold the registers.
pub fn hda_window(bar0: Arc<dyn MmioSpace>) -> Result<RegisterWindow<HdaReg>> {
    WindowBuilder::new(bar0, 0)
        .declare(HdaReg::Gcap, chip::GCAP)
        .declare(HdaReg::Gctl, chip::GCTL)
        .declare(HdaReg::Dplbase, chip::DPLBASE)
        .declare(HdaReg::Dpubase, chip::DPUBASE)
        .declare(HdaReg::Spbfch, chip::SPBFCH)
        .declare(HdaReg::Spbfctl, chip::SPBFCTL)
        .declare(HdaReg::Ppch, chip::PPCH)
        .declare(HdaReg::Ppctl, chip::PPCTL)
        .declare(HdaReg::Ppsts, chip::PPSTS)
        .freeze()
}

/// One stream descriptor, plus the stream's SPIB register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamReg {
    /// Control + status
    Ctl,
    /// Link position in buffer
    Lpib,
    /// Cyclic buffer length
    Cbl,
    /// Last valid index + FIFO watermark
    Lvi,
    /// FIFO size + format
    Fifos,
    /// FIFO limit
    Fifol,
    /// BDL pointer, lower
    Bdpl,
    /// BDL pointer, upper
    Bdpu,
    /// Software position in buffer
    Spib,
}

/// Build the descriptor window for `stream` over BAR0.
///
/// # Panics
///
/// Panics if `stream` exceeds [`chip::MAX_STREAM_ID`].
///
/// # Errors
///
/// Fails if BAR0 is too small to hold the descriptor.
pub fn stream_window(bar0: Arc<dyn MmioSpace>, stream: u8) -> Result<RegisterWindow<StreamReg>> {
    assert!(stream <= chip::MAX_STREAM_ID, "stream id {stream} out of range");
    let base = chip::stream_base(stream);
    WindowBuilder::new(bar0, base)
        .declare(StreamReg::Ctl, chip::sd::CTL)
        .declare(StreamReg::Lpib, chip::sd::LPIB)
        .declare(StreamReg::Cbl, chip::sd::CBL)
        .declare(StreamReg::Lvi, chip::sd::LVI)
        .declare(StreamReg::Fifos, chip::sd::FIFOS)
        .declare(StreamReg::Fifol, chip::sd::FIFOL)
        .declare(StreamReg::Bdpl, chip::sd::BDPL)
        .declare(StreamReg::Bdpu, chip::sd::BDPU)
        .declare(StreamReg::Spib, chip::spib(stream) - base)
        .freeze()
}

/// Stream debug block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDebugReg {
    /// DMA position in buffer
    Dpib,
    /// Enhanced FIFO size
    Efifos,
}

/// Build the debug window for `stream` over BAR0.
///
/// # Errors
///
/// Fails if BAR0 is too small to hold the block.
pub fn stream_debug_window(
    bar0: Arc<dyn MmioSpace>,
    stream: u8,
) -> Result<RegisterWindow<StreamDebugReg>> {
    WindowBuilder::new(bar0, chip::stream_debug_base(stream))
        .declare(StreamDebugReg::Dpib, chip::sd::DPIB)
        .declare(StreamDebugReg::Efifos, chip::sd::EFIFOS)
        .freeze()
}

/// DSP control registers (BAR4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DspReg {
    /// Core power / reset / stall
    Adspcs,
    /// DSP to host doorbell
    Hipctdr,
    /// DSP to host done (1.8+)
    Hipctda,
    /// DSP to host payload
    Hipctdd,
    /// Host to DSP doorbell
    Hipcidr,
    /// Host to DSP done (1.8+)
    Hipcida,
    /// Host to DSP payload
    Hipcidd,
    /// First word of SRAM window 0
    SramFwStatus,
}

/// Build the DSP window over BAR4. `Hipctda`/`Hipcida` are only declared
/// when the layout has them.
///
/// # Errors
///
/// Fails if BAR4 is too small to hold the registers.
pub fn dsp_window(bar4: Arc<dyn MmioSpace>, layout: DspLayout) -> Result<RegisterWindow<DspReg>> {
    let mut builder = WindowBuilder::new(bar4, 0)
        .declare(DspReg::Adspcs, chip::ADSPCS)
        .declare(DspReg::Hipctdr, layout.hipctdr)
        .declare(DspReg::Hipctdd, layout.hipctdd)
        .declare(DspReg::Hipcidr, layout.hipcidr)
        .declare(DspReg::Hipcidd, layout.hipcidd)
        .declare(DspReg::SramFwStatus, chip::SRAM_FW_STATUS);
    if let Some(offset) = layout.hipctda {
        builder = builder.declare(DspReg::Hipctda, offset);
    }
    if let Some(offset) = layout.hipcida {
        builder = builder.declare(DspReg::Hipcida, offset);
    }
    builder.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemorySpace;
    use cavs_chip::pcie::ChipGeneration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Test {
        A,
        B,
    }

    fn space(len: usize) -> Arc<dyn MmioSpace> {
        Arc::new(MemorySpace::new(len))
    }

    #[test]
    fn frozen_window_reads_and_writes_at_base_plus_offset() {
        let mem = space(0x100);
        let win = WindowBuilder::new(mem.clone(), 0x40)
            .declare(Test::A, 0x00)
            .declare(Test::B, 0x08)
            .freeze()
            .unwrap();
        win.write(Test::B, 0x1234);
        assert_eq!(mem.read32(0x48), 0x1234);
        win.set_bits(Test::B, 0x1);
        win.clear_bits(Test::B, 0x4);
        assert_eq!(win.read(Test::B), 0x1231);
        assert_eq!(win.offset(Test::A), 0x40);
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn duplicate_name_panics() {
        let _ = WindowBuilder::new(space(0x10), 0)
            .declare(Test::A, 0)
            .declare(Test::A, 4);
    }

    #[test]
    #[should_panic(expected = "aliases")]
    fn aliased_offset_panics() {
        let _ = WindowBuilder::new(space(0x10), 0)
            .declare(Test::A, 4)
            .declare(Test::B, 4);
    }

    #[test]
    #[should_panic(expected = "not declared")]
    fn undeclared_access_panics() {
        let win = WindowBuilder::new(space(0x10), 0)
            .declare(Test::A, 0)
            .freeze()
            .unwrap();
        win.read(Test::B);
    }

    #[test]
    fn field_past_mapping_fails_freeze() {
        let err = WindowBuilder::new(space(0x10), 0x8)
            .declare(Test::A, 0x8)
            .freeze()
            .unwrap_err();
        assert!(matches!(err, CavsError::RegisterLayout { .. }));
    }

    #[test]
    fn dsp_window_follows_generation() {
        let bar4 = space(0x10_0000);
        let old = dsp_window(bar4.clone(), DspLayout::for_generation(ChipGeneration::Cavs15)).unwrap();
        let new = dsp_window(bar4, DspLayout::for_generation(ChipGeneration::Cavs25)).unwrap();
        assert!(!old.has(DspReg::Hipctda));
        assert!(new.has(DspReg::Hipcida));
        assert_eq!(old.offset(DspReg::Hipcidr), 0x48);
        assert_eq!(new.offset(DspReg::SramFwStatus), 0x8_0000);
    }

    #[test]
    fn stream_window_places_spib() {
        let win = stream_window(space(0x1000), 4).unwrap();
        assert_eq!(win.offset(StreamReg::Ctl), 0x80 + 4 * 0x20);
        assert_eq!(win.offset(StreamReg::Spib), 0x708 + 4 * 8);
    }
}
