//! Timing and mode configuration
//!
//! The sleeps in [`HwTiming`] are empirical: several of them exist only
//! because some boards hang the DSP without them. [`HwTiming::immediate`]
//! removes every sleep for use against [`crate::sim::SimulatedAdsp`].

use crate::poll::PollConfig;
use std::time::Duration;

/// Hardware pacing.
#[derive(Debug, Clone, Copy)]
pub struct HwTiming {
    /// Pause between clearing a stream's RUN bit and touching SRST.
    pub stream_settle: Duration,
    /// Pause after un-stalling the cores before polling ROM status.
    pub rom_boot_settle: Duration,
    /// Sampling interval of FW_ENTERED waits (100 Hz).
    pub fw_poll_interval: Duration,
    /// Pause after acknowledging HIPCTDR on cAVS 1.8, before any other
    /// doorbell write.
    pub cavs18_ack_settle: Duration,
    /// Delay before the deferred DONE of host command 1.
    pub delayed_done: Duration,
    /// Sampling interval of the IPC doorbell.
    pub ipc_poll_interval: Duration,
    /// Sampling interval of the log window.
    pub log_poll_interval: Duration,
    /// Back-off after an unknown command from a dead core.
    pub dead_core_backoff: Duration,
    /// Pause between a finished load and draining pending doorbells.
    pub post_load_settle: Duration,
    /// Bound on each half of the stream reset handshake.
    pub stream_reset: PollConfig,
}

impl Default for HwTiming {
    fn default() -> Self {
        Self {
            stream_settle: Duration::from_millis(100),
            rom_boot_settle: Duration::from_secs(1),
            fw_poll_interval: Duration::from_millis(10),
            cavs18_ack_settle: Duration::from_millis(10),
            delayed_done: Duration::from_millis(100),
            ipc_poll_interval: Duration::from_millis(10),
            log_poll_interval: Duration::from_millis(30),
            dead_core_backoff: Duration::from_secs(2),
            post_load_settle: Duration::from_millis(100),
            stream_reset: PollConfig::default(),
        }
    }
}

impl HwTiming {
    /// No sleeps at all. Only safe against simulated hardware.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            stream_settle: Duration::ZERO,
            rom_boot_settle: Duration::ZERO,
            fw_poll_interval: Duration::ZERO,
            cavs18_ack_settle: Duration::ZERO,
            delayed_done: Duration::ZERO,
            ipc_poll_interval: Duration::ZERO,
            log_poll_interval: Duration::ZERO,
            dead_core_backoff: Duration::ZERO,
            post_load_settle: Duration::ZERO,
            stream_reset: PollConfig::default(),
        }
    }
}

/// Firmware load options.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// How long the loaded firmware gets to report FW_ENTERED.
    pub fw_entered_timeout: Duration,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            fw_entered_timeout: Duration::from_secs(2),
        }
    }
}

/// Where a fresh log reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryMode {
    /// Replay everything still held in the ring.
    #[default]
    Replay,
    /// Only show output written after the reader attached.
    SkipHistory,
}

/// Which SRAM window carries the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogWindow {
    /// Window 3, the trace window.
    #[default]
    Trace,
    /// Window 2, the debug window.
    Debug,
}

impl LogWindow {
    /// BAR4 offset of the window.
    #[must_use]
    pub const fn offset(self) -> usize {
        match self {
            Self::Trace => cavs_chip::windows::TRACE_OFFSET,
            Self::Debug => cavs_chip::windows::DEBUG_OFFSET,
        }
    }
}

/// On-memory log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Sequence-numbered ring ([`crate::log::WinstreamReader`]).
    #[default]
    Winstream,
    /// Linear mtrace buffer ([`crate::log::MtraceReader`]).
    Mtrace,
}
