//! Audio DSP device handle
//!
//! [`AdspDevice`] owns both BAR mappings and everything derived from them:
//! the HD-Audio controller, the DSP register window, the chip generation and
//! the index of the output stream used for firmware transfer. Boot
//! ([`crate::boot`]) and IPC ([`crate::ipc`]) operate on it.

use crate::config::HwTiming;
use crate::discovery::read_hex_sysfs;
use crate::error::{CavsError, Result};
use crate::hda::HdaController;
use crate::hugepage::{DmaAllocator, HugePageAllocator};
use crate::mmio::{BarMapping, MmioSpace};
use crate::poll::{poll_every, PollOutcome};
use crate::regs::{dsp_window, DspReg, RegisterWindow};
use cavs_chip::pcie::ChipGeneration;
use cavs_chip::regs::{adspcs, DspLayout};
use cavs_chip::windows::fw_status;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Power / reset / run state derived from `ADSPCS`. Never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DspState {
    /// Powered, held in reset, not stalled.
    Reset,
    /// Powered and stalled (possibly also in reset).
    Stalled,
    /// Power request dropped, or both request and acknowledge clear.
    PoweringDown,
    /// Power requested but not yet acknowledged.
    PoweringUp,
    /// Powered, out of reset, not stalled.
    Running,
}

impl DspState {
    /// Classify an `ADSPCS` value, looking at the cores in `generation`'s mask.
    pub fn classify(adspcs_value: u32, generation: ChipGeneration) -> Self {
        let any = |field| adspcs_value & generation.power_mask(field) != 0;
        match (any(adspcs::CPA), any(adspcs::SPA), any(adspcs::CRST), any(adspcs::CSTALL)) {
            (false, true, _, _) => Self::PoweringUp,
            (false, false, _, _) => Self::PoweringDown,
            (true, _, _, true) => Self::Stalled,
            (true, _, true, false) => Self::Reset,
            (true, _, false, false) => Self::Running,
        }
    }
}

/// An open cAVS device.
#[derive(Debug)]
pub struct AdspDevice {
    generation: ChipGeneration,
    hda: HdaController,
    dsp: RegisterWindow<DspReg>,
    bar4: Arc<dyn MmioSpace>,
    output_stream: u8,
    allocator: Arc<dyn DmaAllocator>,
    timing: HwTiming,
    pci_dir: Option<PathBuf>,
}

impl AdspDevice {
    /// Map the device at `pci_dir` (a `/sys/bus/pci/devices/...` directory).
    ///
    /// # Errors
    ///
    /// Fails if the device id is unknown or a BAR cannot be mapped.
    pub fn open(pci_dir: &Path, timing: HwTiming) -> Result<Self> {
        let device_id = read_hex_sysfs(&pci_dir.join("device"))?;
        let generation = ChipGeneration::from_device_id(device_id)
            .ok_or(CavsError::UnsupportedDevice { device_id })?;
        info!("Detected {generation} hardware ({device_id:#06x})");

        let bar0: Arc<dyn MmioSpace> = Arc::new(BarMapping::open(pci_dir, 0)?);
        let bar4: Arc<dyn MmioSpace> = Arc::new(BarMapping::open(pci_dir, 4)?);
        let allocator = Arc::new(HugePageAllocator::from_env());
        let mut device = Self::from_spaces(bar0, bar4, generation, allocator, timing)?;
        device.pci_dir = Some(pci_dir.to_path_buf());
        Ok(device)
    }

    /// Build a device over already-mapped BARs.
    ///
    /// # Errors
    ///
    /// Fails if a BAR is too small for its register window.
    pub fn from_spaces(
        bar0: Arc<dyn MmioSpace>,
        bar4: Arc<dyn MmioSpace>,
        generation: ChipGeneration,
        allocator: Arc<dyn DmaAllocator>,
        timing: HwTiming,
    ) -> Result<Self> {
        let hda = HdaController::new(bar0)?;
        let dsp = dsp_window(Arc::clone(&bar4), DspLayout::for_generation(generation))?;
        let output_stream = hda.first_output_stream();
        Ok(Self {
            generation,
            hda,
            dsp,
            bar4,
            output_stream,
            allocator,
            timing,
            pci_dir: None,
        })
    }

    /// Chip generation.
    pub const fn generation(&self) -> ChipGeneration {
        self.generation
    }

    /// HD-Audio controller.
    pub const fn hda(&self) -> &HdaController {
        &self.hda
    }

    /// DSP register window.
    pub const fn dsp(&self) -> &RegisterWindow<DspReg> {
        &self.dsp
    }

    /// BAR4, for memory-window access.
    pub fn bar4(&self) -> Arc<dyn MmioSpace> {
        Arc::clone(&self.bar4)
    }

    /// HD-Audio index of the first output stream.
    pub const fn output_stream(&self) -> u8 {
        self.output_stream
    }

    /// DMA buffer source.
    pub fn allocator(&self) -> Arc<dyn DmaAllocator> {
        Arc::clone(&self.allocator)
    }

    /// Hardware pacing in use.
    pub const fn timing(&self) -> HwTiming {
        self.timing
    }

    /// Sysfs directory, when opened from one.
    pub fn pci_dir(&self) -> Option<&Path> {
        self.pci_dir.as_deref()
    }

    /// Core mask for this generation, shifted to an `ADSPCS` field.
    pub const fn mask(&self, field_shift: u32) -> u32 {
        self.generation.power_mask(field_shift)
    }

    /// Current `SRAM_FW_STATUS`.
    pub fn fw_status(&self) -> u32 {
        self.dsp.read(DspReg::SramFwStatus)
    }

    /// True if the firmware reports FW_ENTERED.
    pub fn fw_is_alive(&self) -> bool {
        fw_status::fw_entered(self.fw_status())
    }

    /// Current power state.
    pub fn dsp_state(&self) -> DspState {
        DspState::classify(self.dsp.read(DspReg::Adspcs), self.generation)
    }

    /// Wait for FW_ENTERED, sampling at 100 Hz. `None` waits forever; `stop`
    /// cancels the wait.
    pub fn wait_fw_entered(&self, timeout: Option<Duration>, stop: Option<&AtomicBool>) -> PollOutcome {
        info!(
            "Waiting {} for firmware handoff, FW_STATUS = {:#x}",
            timeout.map_or_else(|| "forever".to_string(), |t| format!("{}ms", t.as_millis())),
            self.fw_status()
        );
        let outcome = poll_every(self.timing.fw_poll_interval, timeout, stop, || self.fw_is_alive());
        match outcome {
            PollOutcome::Ready => info!("FW alive, FW_STATUS = {:#x}", self.fw_status()),
            PollOutcome::TimedOut => warn!("Load failed?  FW_STATUS = {:#x}", self.fw_status()),
            PollOutcome::Stopped => info!("Stopped waiting for firmware"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedAdsp;

    const CPA: u32 = 24;
    const SPA: u32 = 16;
    const CSTALL: u32 = 8;

    #[test]
    fn state_classification() {
        let g = ChipGeneration::Cavs15;
        assert_eq!(DspState::classify(0, g), DspState::PoweringDown);
        assert_eq!(DspState::classify(0b11 << SPA, g), DspState::PoweringUp);
        assert_eq!(DspState::classify((0b11 << CPA) | (0b11 << SPA) | 0b11, g), DspState::Reset);
        assert_eq!(
            DspState::classify((0b11 << CPA) | (0b11 << CSTALL) | 0b11, g),
            DspState::Stalled
        );
        assert_eq!(DspState::classify((0b11 << CPA) | (0b11 << SPA), g), DspState::Running);
    }

    #[test]
    fn classification_ignores_cores_outside_mask() {
        // cAVS 2.5 only looks at core 0
        let g = ChipGeneration::Cavs25;
        assert_eq!(DspState::classify((1 << CPA) | (0b10 << CSTALL), g), DspState::Running);
    }

    #[test]
    fn open_from_sim_picks_output_stream() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs18).with_input_streams(4);
        let dev = sim.device(HwTiming::immediate()).unwrap();
        assert_eq!(dev.output_stream(), 4);
        assert_eq!(dev.generation(), ChipGeneration::Cavs18);
        assert!(dev.pci_dir().is_none());
    }

    #[test]
    fn fw_entered_wait() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs18);
        let dev = sim.device(HwTiming::immediate()).unwrap();
        assert_eq!(dev.wait_fw_entered(Some(Duration::ZERO), None), PollOutcome::TimedOut);
        sim.set_fw_status(fw_status::FW_ENTERED);
        assert!(dev.fw_is_alive());
        assert_eq!(dev.wait_fw_entered(None, None), PollOutcome::Ready);
    }

    #[test]
    fn unknown_device_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("device"), "0x1234\n").unwrap();
        let err = AdspDevice::open(dir.path(), HwTiming::immediate()).unwrap_err();
        assert!(matches!(err, CavsError::UnsupportedDevice { device_id: 0x1234 }));
    }
}
