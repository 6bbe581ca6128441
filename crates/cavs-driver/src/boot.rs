//! Power & boot sequencer
//!
//! Walks the DSP from whatever state it is in to running firmware:
//!
//! ```text
//! Reset ──(CSTALL, CRST; wait CRST)──▶ Stalled ──(clear SPA; wait !CPA)──▶ PoweringDown
//!   ──(program DMA; set SPA; wait CPA)──▶ PoweringUp ──(clear CRST; wait; clear CSTALL)──▶ Running
//! ```
//!
//! then waits for the ROM, sends `PURGE_FW`, starts the transfer stream and
//! waits (bounded) for FW_ENTERED. Each power step waits for the hardware
//! to acknowledge it before the next one starts. The power polls are
//! unbounded.

use crate::config::BootConfig;
use crate::device::AdspDevice;
use crate::error::{CavsError, Result};
use crate::poll::{spin_until, PollOutcome};
use crate::regs::DspReg;
use crate::stream::HdaStream;
use cavs_chip::firmware;
use cavs_chip::ipc::purge_fw;
use cavs_chip::pcie::ChipGeneration;
use cavs_chip::regs::adspcs;
use cavs_chip::windows::fw_status;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of a successful firmware load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    /// Bytes handed to DMA.
    pub image_len: usize,
    /// Extended manifest bytes trimmed from the front of the file.
    pub manifest_len: usize,
    /// `SRAM_FW_STATUS` once the firmware reported in.
    pub fw_status: u32,
    /// Wall time of the whole sequence.
    pub elapsed: Duration,
}

impl AdspDevice {
    /// Read `path` and boot it. See [`load_firmware`](Self::load_firmware).
    ///
    /// # Errors
    ///
    /// Returns [`CavsError::FirmwareRead`] if the file cannot be read, or
    /// anything [`load_firmware`](Self::load_firmware) returns.
    pub fn load_firmware_file(&self, path: &Path, config: &BootConfig) -> Result<BootReport> {
        let image = std::fs::read(path).map_err(|source| CavsError::FirmwareRead {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loading {} ({} bytes)", path.display(), image.len());
        self.load_firmware(&image, config)
    }

    /// Power-cycle the DSP and boot `image` through the ROM.
    ///
    /// # Errors
    ///
    /// Returns [`CavsError::FirmwareLoad`] with the last status word if the
    /// firmware does not report FW_ENTERED within the configured timeout,
    /// [`CavsError::FirmwareTooLarge`] if the image does not fit one DMA
    /// page, and allocation or stream-reset errors.
    pub fn load_firmware(&self, image: &[u8], config: &BootConfig) -> Result<BootReport> {
        let started = Instant::now();
        let manifest_len = firmware::trim_len(image);
        let image = &image[manifest_len..];
        if manifest_len != 0 {
            info!("Trimming {manifest_len} bytes of extended manifest");
        }

        let hda = self.hda();
        hda.enable_processing();
        hda.reset_link();

        self.stall_and_reset();
        self.power_down();

        info!("Configuring DMA transfer on stream {}", self.output_stream());
        let mut stream =
            HdaStream::attach(hda, self.allocator(), self.output_stream(), self.timing())?;
        stream.configure_firmware(image)?;

        self.power_up();
        self.release_reset();
        self.wait_rom_ready();

        let dma_index = match self.generation() {
            ChipGeneration::Cavs15 => self.output_stream(),
            ChipGeneration::Cavs18 | ChipGeneration::Cavs25 => 0,
        };
        info!("Sending PURGE_FW for DMA index {dma_index}");
        self.dsp().write(DspReg::Hipcidr, purge_fw(dma_index));

        info!("Starting DMA, FW_STATUS = {:#x}", self.fw_status());
        stream.start();

        let outcome = self.wait_fw_entered(Some(config.fw_entered_timeout), None);
        stream.stop();
        let status = self.fw_status();
        if outcome != PollOutcome::Ready {
            warn!("Firmware load failed, FW_STATUS = {status:#x}");
            return Err(CavsError::FirmwareLoad { status });
        }

        let report = BootReport {
            image_len: image.len(),
            manifest_len,
            fw_status: status,
            elapsed: started.elapsed(),
        };
        info!(
            "Firmware running after {}ms ({} bytes)",
            report.elapsed.as_millis(),
            report.image_len
        );
        Ok(report)
    }

    fn stall_and_reset(&self) {
        info!("Stalling and resetting DSP cores, ADSPCS = {:#x}", self.adspcs());
        let dsp = self.dsp();
        dsp.set_bits(DspReg::Adspcs, self.mask(adspcs::CSTALL));
        dsp.set_bits(DspReg::Adspcs, self.mask(adspcs::CRST));
        spin_until(|| self.adspcs() & self.mask(adspcs::CRST) != 0);
    }

    fn power_down(&self) {
        info!("Powering down DSP cores, ADSPCS = {:#x}", self.adspcs());
        self.dsp().clear_bits(DspReg::Adspcs, self.mask(adspcs::SPA));
        spin_until(|| self.adspcs() & self.mask(adspcs::CPA) == 0);
    }

    fn power_up(&self) {
        // CRST and CSTALL stay set so the cores come up held
        info!("Powering up DSP cores, ADSPCS = {:#x}", self.adspcs());
        self.dsp().set_bits(DspReg::Adspcs, self.mask(adspcs::SPA));
        spin_until(|| self.adspcs() & self.mask(adspcs::CPA) != 0);
    }

    fn release_reset(&self) {
        info!("Unresetting DSP cores, ADSPCS = {:#x}", self.adspcs());
        self.dsp().clear_bits(DspReg::Adspcs, self.mask(adspcs::CRST));
        spin_until(|| self.adspcs() & adspcs::CORE0_CRST == 0);

        info!("Running DSP cores, ADSPCS = {:#x}", self.adspcs());
        self.dsp().clear_bits(DspReg::Adspcs, self.mask(adspcs::CSTALL));
    }

    fn wait_rom_ready(&self) {
        std::thread::sleep(self.timing().rom_boot_settle);
        info!("Waiting for ROM init, FW_STATUS = {:#x}", self.fw_status());
        spin_until(|| fw_status::rom_ready(self.fw_status()));
        debug!("ROM ready, FW_STATUS = {:#x}", self.fw_status());
    }

    fn adspcs(&self) -> u32 {
        self.dsp().read(DspReg::Adspcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HwTiming;
    use crate::sim::SimulatedAdsp;

    fn image(manifest: bool) -> Vec<u8> {
        let mut out = Vec::new();
        if manifest {
            out.extend_from_slice(b"XMan");
            out.extend_from_slice(&8u32.to_le_bytes());
        }
        out.extend(std::iter::repeat(0x5a).take(1024));
        out
    }

    #[test]
    fn boots_and_trims_manifest() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs18);
        let dev = sim.device(HwTiming::immediate()).unwrap();
        let report = dev.load_firmware(&image(true), &BootConfig::default()).unwrap();
        assert_eq!(report.image_len, 1024);
        assert_eq!(report.manifest_len, 8);
        assert!(fw_status::fw_entered(report.fw_status));
        assert!(dev.fw_is_alive());
    }

    #[test]
    fn failed_boot_reports_status() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs25).never_enter();
        let dev = sim.device(HwTiming::immediate()).unwrap();
        let config = BootConfig {
            fw_entered_timeout: Duration::ZERO,
        };
        let err = dev.load_firmware(&image(false), &config).unwrap_err();
        match err {
            CavsError::FirmwareLoad { status } => assert!(fw_status::rom_ready(status)),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs18);
        let dev = sim.device(HwTiming::immediate()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = dev
            .load_firmware_file(&dir.path().join("absent.ri"), &BootConfig::default())
            .unwrap_err();
        assert!(matches!(err, CavsError::FirmwareRead { .. }));
    }
}
