//! HD-Audio controller: the generic registers shared by all streams

use crate::error::Result;
use crate::mmio::MmioSpace;
use crate::poll::spin_until;
use crate::regs::{hda_window, HdaReg, RegisterWindow};
use cavs_chip::regs::{gcap, gctl, ppctl, spbfctl};
use std::sync::Arc;
use tracing::{debug, info};

/// Generic HD-Audio registers over BAR0.
#[derive(Debug, Clone)]
pub struct HdaController {
    bar0: Arc<dyn MmioSpace>,
    regs: RegisterWindow<HdaReg>,
}

impl HdaController {
    /// Bind to a mapped BAR0.
    ///
    /// # Errors
    ///
    /// Fails if BAR0 is too small for the register block.
    pub fn new(bar0: Arc<dyn MmioSpace>) -> Result<Self> {
        let regs = hda_window(Arc::clone(&bar0))?;
        Ok(Self { bar0, regs })
    }

    /// The mapping, for building per-stream windows.
    pub fn bar0(&self) -> Arc<dyn MmioSpace> {
        Arc::clone(&self.bar0)
    }

    /// Raw register access.
    pub fn regs(&self) -> &RegisterWindow<HdaReg> {
        &self.regs
    }

    /// Index of the first output stream, which equals the number of input
    /// streams reported in GCAP.
    pub fn first_output_stream(&self) -> u8 {
        let gcap = self.regs.read(HdaReg::Gcap);
        let id = gcap::input_streams(gcap);
        info!("Selected output stream {id} (GCAP = {gcap:#x})");
        id
    }

    /// Set GPROCEN. On these parts it also opens access to the BAR4
    /// registers.
    pub fn enable_processing(&self) {
        self.regs.set_bits(HdaReg::Ppctl, ppctl::GPROCEN);
    }

    /// Put the link through reset and back out. Both polls are unbounded.
    pub fn reset_link(&self) {
        info!("Resetting HDA device");
        self.regs.write(HdaReg::Gctl, 0);
        spin_until(|| self.regs.read(HdaReg::Gctl) & gctl::CRST == 0);
        self.regs.write(HdaReg::Gctl, gctl::CRST);
        spin_until(|| self.regs.read(HdaReg::Gctl) & gctl::CRST != 0);
    }

    /// Enable DSP processing of `stream` (PPCTL.PROCEN).
    pub fn enable_stream_processing(&self, stream: u8) {
        self.regs.set_bits(HdaReg::Ppctl, ppctl::procen(stream));
    }

    /// True if PPCTL.PROCEN is set for `stream`.
    pub fn stream_processing(&self, stream: u8) -> bool {
        self.regs.read(HdaReg::Ppctl) & ppctl::procen(stream) != 0
    }

    /// Turn on the SPIB boundary for `stream`.
    pub fn enable_spib(&self, stream: u8) {
        self.regs.set_bits(HdaReg::Spbfctl, spbfctl::spib_enable(stream));
    }

    /// Turn off the SPIB boundary for `stream`.
    pub fn disable_spib(&self, stream: u8) {
        self.regs.clear_bits(HdaReg::Spbfctl, spbfctl::spib_enable(stream));
    }

    /// Log the generic registers.
    pub fn dump(&self) {
        debug!(
            "HDA: GCAP {:#x}, GCTL {:#x}, SPBFCTL {:#x}, PPCTL {:#x}, PPSTS {:#x}",
            self.regs.read(HdaReg::Gcap),
            self.regs.read(HdaReg::Gctl),
            self.regs.read(HdaReg::Spbfctl),
            self.regs.read(HdaReg::Ppctl),
            self.regs.read(HdaReg::Ppsts),
        );
    }
}
