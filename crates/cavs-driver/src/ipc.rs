//! IPC command dispatcher
//!
//! The test firmware drives the host through the target doorbell: it puts
//! an argument in `HIPCTDD`, a command number in `HIPCTDR` with BUSY set,
//! and waits. The host runs the command, clears BUSY (write-one-to-clear),
//! signals DONE in `HIPCTDA` on 1.8+, and for some commands posts a reply
//! through `HIPCIDD`/`HIPCIDR`.
//!
//! Stream commands address HD-Audio streams by number. A stream comes into
//! existence on its first RESET and lives until the dispatcher is dropped,
//! at which point every stream is reset.

use crate::deferred::DeferredQueue;
use crate::device::AdspDevice;
use crate::error::{CavsError, Result};
use crate::poll::PollOutcome;
use crate::regs::DspReg;
use crate::stream::HdaStream;
use cavs_chip::ipc::{arg, HostCommand, BUSY};
use cavs_chip::pcie::ChipGeneration;
use cavs_chip::windows::{INBOX_OFFSET, OUTBOX_OFFSET};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// What to do when an unknown command arrives and the firmware no longer
/// reports FW_ENTERED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadCorePolicy {
    /// Sleep for the dead-core back-off, leaving the doorbell pending.
    #[default]
    BackOff,
    /// Wait, with no timeout, for the firmware to come back.
    AwaitReentry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Deferred {
    SignalDone,
}

/// Services host commands from the DSP.
pub struct IpcDispatcher<'d> {
    device: &'d AdspDevice,
    streams: HashMap<u8, HdaStream>,
    last_timestamp: Instant,
    deferred: DeferredQueue<Deferred>,
    out: Box<dyn Write + Send + 'd>,
    dead_core: DeadCorePolicy,
    stop: Option<&'d AtomicBool>,
}

impl std::fmt::Debug for IpcDispatcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcDispatcher")
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .field("deferred", &self.deferred.len())
            .field("dead_core", &self.dead_core)
            .finish_non_exhaustive()
    }
}

impl<'d> IpcDispatcher<'d> {
    /// Dispatcher printing stream output to stdout.
    pub fn new(device: &'d AdspDevice) -> Self {
        Self {
            device,
            streams: HashMap::new(),
            last_timestamp: Instant::now(),
            deferred: DeferredQueue::new(),
            out: Box::new(std::io::stdout()),
            dead_core: DeadCorePolicy::default(),
            stop: None,
        }
    }

    /// Send PRINT output to `out` instead of stdout.
    #[must_use]
    pub fn with_output(mut self, out: Box<dyn Write + Send + 'd>) -> Self {
        self.out = out;
        self
    }

    /// Choose the dead-core behaviour.
    #[must_use]
    pub fn with_dead_core_policy(mut self, policy: DeadCorePolicy) -> Self {
        self.dead_core = policy;
        self
    }

    /// Stop [`run`](Self::run) and re-entry waits once `stop` is raised.
    #[must_use]
    pub fn with_stop_flag(mut self, stop: &'d AtomicBool) -> Self {
        self.stop = Some(stop);
        self
    }

    /// A stream created by a RESET command.
    pub fn stream(&self, id: u8) -> Option<&HdaStream> {
        self.streams.get(&id)
    }

    /// Number of delayed DONE signals not yet written.
    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Give freshly booted firmware time to settle before its doorbells are
    /// touched. Call before [`Self::service_pending`].
    pub fn settle(&self) {
        std::thread::sleep(self.device.timing().post_load_settle);
    }

    /// Post-load handshake: acknowledge a DONE the firmware may have raised
    /// for `PURGE_FW`, and service one command it may already have posted.
    /// A delayed DONE that command schedules is written before returning.
    ///
    /// # Errors
    ///
    /// Propagates errors from the command, if one was pending.
    pub fn service_pending(&mut self) -> Result<bool> {
        let dsp = self.device.dsp();
        if dsp.has(DspReg::Hipcida) && dsp.read(DspReg::Hipcida) & BUSY != 0 {
            debug!("Acknowledging DONE from the DSP");
            dsp.write(DspReg::Hipcida, BUSY);
        }
        if dsp.read(DspReg::Hipctdr) & BUSY == 0 {
            return Ok(false);
        }
        self.dispatch()?;
        self.flush_deferred();
        Ok(true)
    }

    /// Wait out every deferred DONE still queued and write it. Nothing else
    /// runs them once the dispatcher is dropped.
    pub fn flush_deferred(&mut self) {
        while let Some(deadline) = self.deferred.next_deadline() {
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            self.run_due(Instant::now());
        }
    }

    fn run_due(&mut self, now: Instant) {
        for item in self.deferred.take_due(now) {
            match item {
                Deferred::SignalDone => self.signal_done(),
            }
        }
    }

    /// Run due deferred work, then service the doorbell if it is pending.
    /// Returns true if a command was handled.
    ///
    /// # Errors
    ///
    /// Propagates stream allocation, reset and output errors.
    pub fn poll_once(&mut self) -> Result<bool> {
        self.run_due(Instant::now());
        if self.device.dsp().read(DspReg::Hipctdr) & BUSY != 0 {
            self.dispatch()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Poll the doorbell at the configured cadence until the stop flag is
    /// raised. Without a stop flag this never returns `Ok`.
    ///
    /// # Errors
    ///
    /// Stops at the first command that fails.
    pub fn run(&mut self) -> Result<()> {
        info!("Servicing IPC commands");
        let interval = self.device.timing().ipc_poll_interval;
        loop {
            self.poll_once()?;
            if self.stopped() {
                return Ok(());
            }
            std::thread::sleep(interval);
        }
    }

    fn stopped(&self) -> bool {
        self.stop.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Decode and run the pending command.
    fn dispatch(&mut self) -> Result<()> {
        let dsp = self.device.dsp();
        let word = dsp.read(DspReg::Hipctdr) & !BUSY;
        let ext = dsp.read(DspReg::Hipctdd);
        let Some(command) = HostCommand::from_doorbell(word) else {
            return self.unknown(word, ext);
        };
        self.handle(command, ext)
    }

    fn unknown(&mut self, word: u32, ext: u32) -> Result<()> {
        warn!("Unrecognized IPC command {word:#x} ext {ext:#x}");
        if self.device.fw_is_alive() {
            self.acknowledge(true);
            return Ok(());
        }
        match self.dead_core {
            DeadCorePolicy::AwaitReentry => {
                if self.device.wait_fw_entered(None, self.stop) == PollOutcome::Stopped {
                    debug!("Re-entry wait cancelled");
                }
            }
            DeadCorePolicy::BackOff => {
                warn!("DSP not alive, backing off");
                std::thread::sleep(self.device.timing().dead_core_backoff);
            }
        }
        Ok(())
    }

    /// Run `command` with argument `ext` and complete the doorbell.
    ///
    /// # Panics
    ///
    /// Panics if a stream command other than RESET names a stream that was
    /// never reset, or a data command names one that was never configured.
    ///
    /// # Errors
    ///
    /// Propagates stream allocation, reset and output errors, and
    /// [`CavsError::WindowBounds`] for a COPY outside BAR4.
    pub fn handle(&mut self, command: HostCommand, ext: u32) -> Result<()> {
        debug!("IPC command {command:?} ext {ext:#x}");
        let id = arg::stream_id(ext);
        let mut done = true;
        let mut reply = None;
        match command {
            HostCommand::Nop => {}
            HostCommand::DelayedDone => {
                // On 1.5 the TDR ack doubles as DONE
                if self.device.generation().has_done_registers() {
                    done = false;
                    self.deferred
                        .schedule(self.device.timing().delayed_done, Deferred::SignalDone);
                }
            }
            HostCommand::Echo => reply = Some(ext),
            HostCommand::SetAdspcs => self.device.dsp().write(DspReg::Adspcs, ext),
            HostCommand::Timestamp => reply = Some(self.timestamp()),
            HostCommand::CopyWord => self.copy_word(arg::copy_src(ext), arg::copy_dst(ext))?,
            HostCommand::StreamReset => self.reset_stream(id)?,
            HostCommand::StreamConfig => self.stream_mut(id).configure(arg::length(ext))?,
            HostCommand::StreamStart => self.stream_mut(id).start(),
            HostCommand::StreamStop => self.stream_mut(id).stop(),
            HostCommand::StreamValidate => {
                reply = Some(u32::from(self.stream_mut(id).validate_ramp()));
            }
            HostCommand::StreamSend => {
                self.stream_mut(id).send_ramp();
            }
            HostCommand::StreamPrint => {
                let len = arg::length(ext);
                let stream = self
                    .streams
                    .get_mut(&id)
                    .unwrap_or_else(|| panic!("stream {id} used before reset"));
                stream.print(len, &mut *self.out)?;
            }
        }

        self.acknowledge(done);
        if let Some(value) = reply {
            self.send(value);
        }
        Ok(())
    }

    fn reset_stream(&mut self, id: u8) -> Result<()> {
        if let Some(stream) = self.streams.get_mut(&id) {
            return stream.reset();
        }
        let device = self.device;
        let stream = HdaStream::open(device.hda(), device.allocator(), id, device.timing())?;
        self.streams.insert(id, stream);
        Ok(())
    }

    fn stream_mut(&mut self, id: u8) -> &mut HdaStream {
        self.streams
            .get_mut(&id)
            .unwrap_or_else(|| panic!("stream {id} used before reset"))
    }

    fn timestamp(&mut self) -> u32 {
        let now = Instant::now();
        let delta = now.duration_since(self.last_timestamp);
        self.last_timestamp = now;
        u32::try_from(delta.as_micros()).unwrap_or(u32::MAX)
    }

    fn copy_word(&self, src_index: usize, dst_index: usize) -> Result<()> {
        let bar4 = self.device.bar4();
        let src = OUTBOX_OFFSET + 4 * src_index;
        let dst = INBOX_OFFSET + 4 * dst_index;
        for offset in [src, dst] {
            if offset + 4 > bar4.len() {
                return Err(CavsError::WindowBounds {
                    offset,
                    len: 4,
                    limit: bar4.len(),
                });
            }
        }
        let mut word = [0u8; 4];
        bar4.read_bytes(src, &mut word);
        bar4.write_bytes(dst, &word);
        debug!("Copied outbox[{src_index}] to inbox[{dst_index}]: {word:02x?}");
        Ok(())
    }

    fn acknowledge(&self, done: bool) {
        let dsp = self.device.dsp();
        dsp.write(DspReg::Hipctdr, BUSY);
        if self.device.generation() == ChipGeneration::Cavs18 {
            std::thread::sleep(self.device.timing().cavs18_ack_settle);
        }
        if done {
            self.signal_done();
        }
    }

    fn signal_done(&self) {
        let dsp = self.device.dsp();
        if dsp.has(DspReg::Hipctda) {
            dsp.write(DspReg::Hipctda, BUSY);
        }
    }

    fn send(&self, value: u32) {
        let dsp = self.device.dsp();
        dsp.write(DspReg::Hipcidd, value);
        dsp.write(DspReg::Hipcidr, BUSY | value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HwTiming;
    use crate::sim::{SimBar, SimulatedAdsp};

    fn sim(generation: ChipGeneration) -> (SimulatedAdsp, AdspDevice) {
        let sim = SimulatedAdsp::new(generation);
        let dev = sim.device(HwTiming::immediate()).unwrap();
        (sim, dev)
    }

    #[test]
    fn idle_doorbell_does_nothing() {
        let (_, dev) = sim(ChipGeneration::Cavs18);
        let mut ipc = IpcDispatcher::new(&dev);
        assert!(!ipc.poll_once().unwrap());
    }

    #[test]
    fn echo_replies_through_host_doorbell() {
        let (sim, dev) = sim(ChipGeneration::Cavs18);
        let layout = sim.layout();
        let mut ipc = IpcDispatcher::new(&dev);
        sim.post_command(2, 0x1234);
        assert!(ipc.poll_once().unwrap());
        assert_eq!(sim.peek(SimBar::Bar4, layout.hipctdr) & BUSY, 0);
        assert_eq!(sim.peek(SimBar::Bar4, layout.hipcidd), 0x1234);
        assert_eq!(sim.peek(SimBar::Bar4, layout.hipcidr), BUSY | 0x1234);
        assert_eq!(sim.peek(SimBar::Bar4, layout.hipctda.unwrap()), BUSY);
    }

    #[test]
    fn delayed_done_is_deferred_on_newer_parts() {
        let (sim, dev) = sim(ChipGeneration::Cavs25);
        let tda = sim.layout().hipctda.unwrap();
        let mut ipc = IpcDispatcher::new(&dev);
        sim.post_command(1, 0);
        ipc.poll_once().unwrap();
        // Zero delay: the DONE goes out on the next poll, not during the command
        assert_eq!(ipc.pending_deferred(), 1);
        assert_eq!(sim.peek(SimBar::Bar4, tda), 0);
        ipc.poll_once().unwrap();
        assert_eq!(ipc.pending_deferred(), 0);
        assert_eq!(sim.peek(SimBar::Bar4, tda), BUSY);
    }

    #[test]
    fn post_load_drain_writes_delayed_done_before_returning() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs25);
        let timing = HwTiming {
            delayed_done: std::time::Duration::from_millis(5),
            ..HwTiming::immediate()
        };
        let dev = sim.device(timing).unwrap();
        let tda = sim.layout().hipctda.unwrap();
        let mut ipc = IpcDispatcher::new(&dev);
        sim.post_command(1, 0);

        let started = Instant::now();
        assert!(ipc.service_pending().unwrap());
        assert!(started.elapsed() >= timing.delayed_done);
        assert_eq!(ipc.pending_deferred(), 0);
        assert_eq!(sim.peek(SimBar::Bar4, tda), BUSY);
    }

    #[test]
    fn settle_is_separate_from_the_drain() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs18);
        let timing = HwTiming {
            post_load_settle: std::time::Duration::from_millis(50),
            ..HwTiming::immediate()
        };
        let dev = sim.device(timing).unwrap();
        let mut ipc = IpcDispatcher::new(&dev);

        let started = Instant::now();
        ipc.settle();
        assert!(started.elapsed() >= timing.post_load_settle);

        let started = Instant::now();
        assert!(!ipc.service_pending().unwrap());
        assert!(started.elapsed() < timing.post_load_settle);
    }

    #[test]
    fn flush_with_nothing_queued_returns() {
        let (sim, dev) = sim(ChipGeneration::Cavs25);
        let mut ipc = IpcDispatcher::new(&dev);
        ipc.flush_deferred();
        assert_eq!(sim.peek(SimBar::Bar4, sim.layout().hipctda.unwrap()), 0);
    }

    #[test]
    fn delayed_done_is_synchronous_on_cavs15() {
        let (sim, dev) = sim(ChipGeneration::Cavs15);
        let mut ipc = IpcDispatcher::new(&dev);
        sim.post_command(1, 0);
        ipc.poll_once().unwrap();
        assert_eq!(ipc.pending_deferred(), 0);
        assert_eq!(sim.peek(SimBar::Bar4, sim.layout().hipctdr) & BUSY, 0);
    }

    #[test]
    fn set_adspcs_writes_register() {
        let (sim, dev) = sim(ChipGeneration::Cavs25);
        let mut ipc = IpcDispatcher::new(&dev);
        ipc.handle(HostCommand::SetAdspcs, 0x0000_0101).unwrap();
        assert_eq!(sim.peek(SimBar::Bar4, 4) & 0xffff, 0x0101);
    }

    #[test]
    fn copy_moves_one_word() {
        let (sim, dev) = sim(ChipGeneration::Cavs18);
        sim.write_window(OUTBOX_OFFSET + 12, &[1, 2, 3, 4]);
        let mut ipc = IpcDispatcher::new(&dev);
        ipc.handle(HostCommand::CopyWord, (3 << 16) | 5).unwrap();
        assert_eq!(sim.read_window(INBOX_OFFSET + 20, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn copy_outside_bar_is_rejected() {
        let sim = SimulatedAdsp::new(ChipGeneration::Cavs18);
        let short_bar4 = std::sync::Arc::new(crate::sim::MemorySpace::new(0x9_0000));
        let dev = AdspDevice::from_spaces(
            sim.bar0(),
            short_bar4,
            ChipGeneration::Cavs18,
            std::sync::Arc::new(crate::hugepage::HeapAllocator::new()),
            HwTiming::immediate(),
        )
        .unwrap();
        let mut ipc = IpcDispatcher::new(&dev);
        let err = ipc.handle(HostCommand::CopyWord, 0xffff).unwrap_err();
        assert!(matches!(err, CavsError::WindowBounds { .. }));
    }

    #[test]
    fn unknown_command_from_live_core_is_acked() {
        let (sim, dev) = sim(ChipGeneration::Cavs18);
        sim.set_fw_status(cavs_chip::windows::fw_status::FW_ENTERED);
        let mut ipc = IpcDispatcher::new(&dev);
        sim.post_command(99, 0);
        ipc.poll_once().unwrap();
        assert_eq!(sim.peek(SimBar::Bar4, sim.layout().hipctdr) & BUSY, 0);
    }

    #[test]
    fn unknown_command_from_dead_core_stays_pending() {
        let (sim, dev) = sim(ChipGeneration::Cavs18);
        let mut ipc = IpcDispatcher::new(&dev);
        sim.post_command(99, 0);
        ipc.poll_once().unwrap();
        assert_ne!(sim.peek(SimBar::Bar4, sim.layout().hipctdr) & BUSY, 0);
    }

    #[test]
    fn run_returns_when_stopped() {
        let (_, dev) = sim(ChipGeneration::Cavs18);
        let stop = AtomicBool::new(true);
        let mut ipc = IpcDispatcher::new(&dev).with_stop_flag(&stop);
        ipc.run().unwrap();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn reset_of_stream_past_the_register_blocks_panics() {
        let (_, dev) = sim(ChipGeneration::Cavs18);
        let mut ipc = IpcDispatcher::new(&dev);
        let _ = ipc.handle(HostCommand::StreamReset, 31);
    }

    #[test]
    fn rejected_stream_reset_leaves_processing_registers_alone() {
        let (sim, dev) = sim(ChipGeneration::Cavs18);
        sim.poke(SimBar::Bar0, cavs_chip::regs::PPSTS, 0xdead_beef);
        let ppctl = sim.peek(SimBar::Bar0, cavs_chip::regs::PPCTL);
        let mut ipc = IpcDispatcher::new(&dev);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = ipc.handle(HostCommand::StreamReset, 32);
        }));
        assert!(result.is_err());
        assert_eq!(sim.peek(SimBar::Bar0, cavs_chip::regs::PPSTS), 0xdead_beef);
        assert_eq!(sim.peek(SimBar::Bar0, cavs_chip::regs::PPCTL), ppctl);
    }

    #[test]
    #[should_panic(expected = "used before reset")]
    fn stream_command_before_reset_panics() {
        let (_, dev) = sim(ChipGeneration::Cavs18);
        let mut ipc = IpcDispatcher::new(&dev);
        let _ = ipc.handle(HostCommand::StreamStart, 3);
    }
}
