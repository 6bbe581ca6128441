//! Userspace driver for Intel cAVS audio DSPs.
//!
//! Maps the HD-Audio (BAR0) and DSP (BAR4) register blocks of a cAVS 1.5,
//! 1.8 or 2.5 part straight from sysfs, boots a firmware image through the
//! ROM over an HD-Audio DMA stream, services the test firmware's IPC
//! commands, and tails the log it writes into SRAM.
//!
//! # Layers
//!
//! ```text
//! boot / ipc / log        sequencing, command dispatch, log readers
//!   device                AdspDevice: BARs, generation, allocator, timing
//!   stream / hda          HD-Audio DMA streams and the generic HDA block
//!   regs / hugepage       typed register windows, physically-contiguous buffers
//!   mmio                  MmioSpace trait, sysfs BAR mapping
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use cavs_driver::{discovery, AdspDevice, BootConfig, HwTiming};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let info = discovery::find_first()?;
//! let dev = AdspDevice::open(&info.pci_dir, HwTiming::default())?;
//! let report = dev.load_firmware_file(std::path::Path::new("zephyr.ri"), &BootConfig::default())?;
//! println!("firmware up, FW_STATUS {:#x}", report.fw_status);
//! # Ok(())
//! # }
//! ```
//!
//! Everything above `mmio` runs unchanged against [`sim::SimulatedAdsp`].

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod boot;
pub mod config;
pub mod deferred;
pub mod device;
pub mod discovery;
mod error;
pub mod hda;
pub mod hugepage;
pub mod ipc;
pub mod log;
pub mod mmio;
pub mod poll;
pub mod regs;
pub mod setup;
pub mod sim;
pub mod stream;

pub use boot::BootReport;
pub use config::{BootConfig, HistoryMode, HwTiming, LogFormat, LogWindow};
pub use device::{AdspDevice, DspState};
pub use error::{CavsError, Result};
pub use hugepage::{DmaAllocator, HeapAllocator, HugePageAllocator, PhysicalBuffer};
pub use ipc::{DeadCorePolicy, IpcDispatcher};
pub use log::{LogTail, MemoryWindow, MtraceReader, TraceReader, WinstreamReader};
pub use mmio::{BarMapping, MmioSpace};
pub use stream::HdaStream;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AdspDevice, BootConfig, CavsError, HistoryMode, HwTiming, IpcDispatcher, LogFormat,
        LogTail, LogWindow, Result, TraceReader,
    };
}
