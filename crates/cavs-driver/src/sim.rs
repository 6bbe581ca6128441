//! In-memory stand-ins for the hardware
//!
//! [`MemorySpace`] is plain RAM behind the [`MmioSpace`] trait. [`SimulatedAdsp`]
//! is a two-BAR device with just enough behaviour to walk the boot protocol
//! and the IPC doorbells without silicon:
//!
//! | Register | Behaviour |
//! |----------|-----------|
//! | `ADSPCS` | CPA follows SPA immediately; resetting core 0 clears FW_STATUS; un-stalling a powered core 0 makes the ROM report ready |
//! | output stream `CTL` | setting RUN after `PURGE_FW` makes the firmware report FW_ENTERED (unless disabled) and clears the doorbell |
//! | `HIPCTDR`, `HIPCIDA` | BUSY is write-one-to-clear |
//! | everything else | stores and reads back |
//!
//! Every 32-bit write is recorded together with the `ADSPCS` value at the
//! moment it was issued, so tests can check ordering against power state.

use crate::config::HwTiming;
use crate::device::AdspDevice;
use crate::error::Result;
use crate::hugepage::{DmaAllocator, HeapAllocator};
use crate::mmio::{check_bounds, MmioSpace};
use cavs_chip::ipc::{self, Doorbell, BUSY};
use cavs_chip::pcie::ChipGeneration;
use cavs_chip::regs::{self as chip, adspcs, ctl, DspLayout};
use cavs_chip::windows::fw_status;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Plain RAM exposed as an MMIO region.
#[derive(Debug)]
pub struct MemorySpace {
    mem: Mutex<Vec<u8>>,
}

impl MemorySpace {
    /// `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        Self {
            mem: Mutex::new(vec![0; len]),
        }
    }
}

impl MmioSpace for MemorySpace {
    fn len(&self) -> usize {
        lock(&self.mem).len()
    }

    fn read32(&self, offset: usize) -> u32 {
        load32(&lock(&self.mem), offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        store32(&mut lock(&self.mem), offset, value);
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        let mem = lock(&self.mem);
        check_bounds(offset, buf.len(), mem.len());
        buf.copy_from_slice(&mem[offset..offset + buf.len()]);
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) {
        let mut mem = lock(&self.mem);
        check_bounds(offset, data.len(), mem.len());
        mem[offset..offset + data.len()].copy_from_slice(data);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn load32(mem: &[u8], offset: usize) -> u32 {
    check_bounds(offset, 4, mem.len());
    u32::from_le_bytes([mem[offset], mem[offset + 1], mem[offset + 2], mem[offset + 3]])
}

fn store32(mem: &mut [u8], offset: usize, value: u32) {
    check_bounds(offset, 4, mem.len());
    mem[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Which BAR a recorded write went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBar {
    /// HD-Audio controller
    Bar0,
    /// DSP
    Bar4,
}

/// One recorded 32-bit write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    /// Target BAR
    pub bar: SimBar,
    /// Byte offset inside the BAR
    pub offset: usize,
    /// Value written
    pub value: u32,
    /// `ADSPCS` just before the write took effect
    pub adspcs: u32,
}

const BAR0_LEN: usize = 0x4000;
const BAR4_LEN: usize = 0x10_0000;
const DEFAULT_INPUT_STREAMS: u8 = 7;

#[derive(Debug)]
struct SimState {
    bar0: Vec<u8>,
    bar4: Vec<u8>,
    generation: ChipGeneration,
    layout: DspLayout,
    output_stream: u8,
    fw_enters: bool,
    purge_requested: bool,
    writes: Vec<WriteRecord>,
}

impl SimState {
    fn adspcs(&self) -> u32 {
        load32(&self.bar4, chip::ADSPCS)
    }

    fn write(&mut self, bar: SimBar, offset: usize, value: u32) {
        let record = WriteRecord {
            bar,
            offset,
            value,
            adspcs: self.adspcs(),
        };
        self.writes.push(record);
        match bar {
            SimBar::Bar0 => self.write_bar0(offset, value),
            SimBar::Bar4 => self.write_bar4(offset, value),
        }
    }

    fn write_bar0(&mut self, offset: usize, value: u32) {
        let run_ctl = chip::stream_base(self.output_stream) + chip::sd::CTL;
        let was_running = load32(&self.bar0, run_ctl) & ctl::RUN != 0;
        store32(&mut self.bar0, offset, value);
        if offset == run_ctl && !was_running && value & ctl::RUN != 0 && self.purge_requested {
            self.purge_requested = false;
            let idr = self.layout.hipcidr;
            let pending = load32(&self.bar4, idr);
            store32(&mut self.bar4, idr, pending & !BUSY);
            if self.fw_enters {
                store32(&mut self.bar4, chip::SRAM_FW_STATUS, fw_status::FW_ENTERED);
            }
        }
    }

    fn write_bar4(&mut self, offset: usize, value: u32) {
        let w1c = offset == self.layout.hipctdr || Some(offset) == self.layout.hipcida;
        if w1c {
            let current = load32(&self.bar4, offset);
            let cleared = if value & BUSY != 0 { current & !BUSY } else { current };
            store32(&mut self.bar4, offset, cleared);
            return;
        }

        if offset == chip::ADSPCS {
            // CPA follows SPA
            let spa = (value >> adspcs::SPA) & 0xff;
            let value = (value & 0x00ff_ffff) | (spa << adspcs::CPA);
            store32(&mut self.bar4, offset, value);
            if value & adspcs::CORE0_CRST != 0 {
                store32(&mut self.bar4, chip::SRAM_FW_STATUS, 0);
            }
            let powered = value & self.generation.power_mask(adspcs::CPA) != 0;
            let running = value & (adspcs::CORE0_CRST | (1 << adspcs::CSTALL)) == 0;
            let status = load32(&self.bar4, chip::SRAM_FW_STATUS);
            if powered && running && !fw_status::fw_entered(status) {
                store32(
                    &mut self.bar4,
                    chip::SRAM_FW_STATUS,
                    fw_status::ROM_READY << 24,
                );
            }
            return;
        }

        if offset == self.layout.hipcidr && Doorbell::decode(value).opcode == ipc::rom::PURGE_FW {
            self.purge_requested = true;
        }
        store32(&mut self.bar4, offset, value);
    }
}

#[derive(Debug)]
struct SimSpace {
    bar: SimBar,
    state: Arc<Mutex<SimState>>,
}

impl SimSpace {
    fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = lock(&self.state);
        let mem = match self.bar {
            SimBar::Bar0 => &state.bar0,
            SimBar::Bar4 => &state.bar4,
        };
        f(mem)
    }
}

impl MmioSpace for SimSpace {
    fn len(&self) -> usize {
        self.with(|mem| mem.len())
    }

    fn read32(&self, offset: usize) -> u32 {
        self.with(|mem| load32(mem, offset))
    }

    fn write32(&self, offset: usize, value: u32) {
        lock(&self.state).write(self.bar, offset, value);
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        self.with(|mem| {
            check_bounds(offset, buf.len(), mem.len());
            buf.copy_from_slice(&mem[offset..offset + buf.len()]);
        });
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) {
        let mut state = lock(&self.state);
        let mem = match self.bar {
            SimBar::Bar0 => &mut state.bar0,
            SimBar::Bar4 => &mut state.bar4,
        };
        check_bounds(offset, data.len(), mem.len());
        mem[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// A simulated cAVS device.
#[derive(Debug, Clone)]
pub struct SimulatedAdsp {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedAdsp {
    /// A powered-off device of the given generation with seven input
    /// streams, whose firmware boots successfully.
    pub fn new(generation: ChipGeneration) -> Self {
        let mut bar0 = vec![0; BAR0_LEN];
        store32(&mut bar0, chip::GCAP, u32::from(DEFAULT_INPUT_STREAMS) << 8);
        Self {
            state: Arc::new(Mutex::new(SimState {
                bar0,
                bar4: vec![0; BAR4_LEN],
                generation,
                layout: DspLayout::for_generation(generation),
                output_stream: DEFAULT_INPUT_STREAMS,
                fw_enters: true,
                purge_requested: false,
                writes: Vec::new(),
            })),
        }
    }

    /// Report `n` input streams in GCAP, moving the first output stream.
    #[must_use]
    pub fn with_input_streams(self, n: u8) -> Self {
        {
            let mut state = lock(&self.state);
            let gcap = load32(&state.bar0, chip::GCAP) & !0xf00;
            store32(&mut state.bar0, chip::GCAP, gcap | (u32::from(n & 0xf) << 8));
            state.output_stream = n & 0xf;
        }
        self
    }

    /// Firmware never reaches FW_ENTERED.
    #[must_use]
    pub fn never_enter(self) -> Self {
        lock(&self.state).fw_enters = false;
        self
    }

    /// Device generation.
    pub fn generation(&self) -> ChipGeneration {
        lock(&self.state).generation
    }

    /// Register layout of the DSP BAR.
    pub fn layout(&self) -> DspLayout {
        lock(&self.state).layout
    }

    /// BAR0 as an MMIO space.
    pub fn bar0(&self) -> Arc<dyn MmioSpace> {
        Arc::new(SimSpace {
            bar: SimBar::Bar0,
            state: Arc::clone(&self.state),
        })
    }

    /// BAR4 as an MMIO space.
    pub fn bar4(&self) -> Arc<dyn MmioSpace> {
        Arc::new(SimSpace {
            bar: SimBar::Bar4,
            state: Arc::clone(&self.state),
        })
    }

    /// Open the device with heap-backed DMA buffers.
    ///
    /// # Errors
    ///
    /// Propagates register layout errors.
    pub fn device(&self, timing: HwTiming) -> Result<AdspDevice> {
        self.device_with_allocator(Arc::new(HeapAllocator::new()), timing)
    }

    /// Open the device with a caller-provided allocator.
    ///
    /// # Errors
    ///
    /// Propagates register layout errors.
    pub fn device_with_allocator(
        &self,
        allocator: Arc<dyn DmaAllocator>,
        timing: HwTiming,
    ) -> Result<AdspDevice> {
        AdspDevice::from_spaces(self.bar0(), self.bar4(), self.generation(), allocator, timing)
    }

    /// Every write so far.
    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.state).writes.clone()
    }

    /// Forget recorded writes.
    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    /// Read a BAR register without recording anything.
    pub fn peek(&self, bar: SimBar, offset: usize) -> u32 {
        let state = lock(&self.state);
        match bar {
            SimBar::Bar0 => load32(&state.bar0, offset),
            SimBar::Bar4 => load32(&state.bar4, offset),
        }
    }

    /// Set a BAR register without side effects or recording.
    pub fn poke(&self, bar: SimBar, offset: usize, value: u32) {
        let mut state = lock(&self.state);
        match bar {
            SimBar::Bar0 => store32(&mut state.bar0, offset, value),
            SimBar::Bar4 => store32(&mut state.bar4, offset, value),
        }
    }

    /// Current firmware status word.
    pub fn fw_status(&self) -> u32 {
        self.peek(SimBar::Bar4, chip::SRAM_FW_STATUS)
    }

    /// Overwrite the firmware status word.
    pub fn set_fw_status(&self, status: u32) {
        self.poke(SimBar::Bar4, chip::SRAM_FW_STATUS, status);
    }

    /// Act as the DSP: post host command `number` with argument `arg`.
    pub fn post_command(&self, number: u32, arg: u32) {
        let layout = self.layout();
        self.poke(SimBar::Bar4, layout.hipctdd, arg);
        self.poke(SimBar::Bar4, layout.hipctdr, BUSY | number);
    }

    /// Act as the DSP: signal DONE for the last host message.
    pub fn signal_host_done(&self) {
        if let Some(ida) = self.layout().hipcida {
            self.poke(SimBar::Bar4, ida, BUSY);
        }
    }

    /// Copy bytes into BAR4 (memory windows).
    pub fn write_window(&self, offset: usize, data: &[u8]) {
        self.bar4().write_bytes(offset, data);
    }

    /// Copy bytes out of BAR4.
    pub fn read_window(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.bar4().read_bytes(offset, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpa_follows_spa() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs18);
        let bar4 = sim.bar4();
        bar4.write32(chip::ADSPCS, 0xf << adspcs::SPA);
        assert_eq!(bar4.read32(chip::ADSPCS) >> adspcs::CPA, 0xf);
        bar4.write32(chip::ADSPCS, 0);
        assert_eq!(bar4.read32(chip::ADSPCS), 0);
    }

    #[test]
    fn rom_ready_after_unstall() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs25);
        let bar4 = sim.bar4();
        bar4.write32(chip::ADSPCS, (1 << adspcs::SPA) | (1 << adspcs::CSTALL));
        assert_eq!(sim.fw_status(), 0);
        bar4.write32(chip::ADSPCS, 1 << adspcs::SPA);
        assert!(fw_status::rom_ready(sim.fw_status()));
    }

    #[test]
    fn doorbell_ack_is_write_one_to_clear() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs18);
        sim.post_command(2, 0x55);
        let tdr = sim.layout().hipctdr;
        sim.bar4().write32(tdr, BUSY);
        assert_eq!(sim.peek(SimBar::Bar4, tdr), 2);
    }

    #[test]
    fn writes_are_recorded_with_power_state() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs15);
        let bar4 = sim.bar4();
        bar4.write32(chip::ADSPCS, 0b11 << adspcs::SPA);
        bar4.write32(0x48, 7);
        let log = sim.writes();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].adspcs, 0);
        assert_eq!(log[1].adspcs, (0b11 << adspcs::SPA) | (0b11 << adspcs::CPA));
    }

    #[test]
    fn memory_space_round_trip() {
        let mem = MemorySpace::new(16);
        mem.write32(4, 0x0102_0304);
        let mut out = [0u8; 4];
        mem.read_bytes(4, &mut out);
        assert_eq!(out, [4, 3, 2, 1]);
    }
}
