//! `cavstool`: load firmware onto an Intel cAVS audio DSP and read its log.
//!
//! ```text
//! USAGE:
//!   cavstool load <fw_file>          Boot the DSP with a firmware image
//!   cavstool log [-n] [-w W] [-s S]  Stream the firmware log to stdout
//!
//! GLOBAL:
//!   -q, --quiet       Only warnings and errors
//!   -v, --verbose     Debug output
//!   --pci-dir <path>  Use this sysfs function instead of scanning
//! ```
//!
//! Both commands need root to write PCI config space and map the device
//! BARs. `load` also unloads any kernel driver bound to the DSP.

use anyhow::{bail, Context, Result};
use cavs_driver::discovery;
use cavs_driver::hugepage::HugePageAllocator;
use cavs_driver::log::{decode_text, open_reader};
use cavs_driver::poll::PollOutcome;
use cavs_driver::setup::{ensure_hugetlbfs, DeviceSetup};
use cavs_driver::{
    AdspDevice, BootConfig, DeadCorePolicy, HistoryMode, HwTiming, IpcDispatcher, LogFormat,
    LogTail, LogWindow,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Raised by SIGINT; every wait and the log loop check it.
static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "cavstool", about = "Intel cAVS audio DSP firmware loader and log reader", version)]
struct Cli {
    /// Only print warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Print debug output.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Sysfs directory of the PCI function (e.g. /sys/bus/pci/devices/0000:00:1f.3).
    #[arg(long, global = true)]
    pci_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Reset the DSP and boot it with a firmware image.
    Load {
        /// Firmware image, optionally with an extended manifest.
        fw_file: PathBuf,
    },
    /// Copy the firmware log to stdout until interrupted.
    Log {
        /// Skip output already in the buffer.
        #[arg(short = 'n', long)]
        no_history: bool,
        /// Memory window holding the log.
        #[arg(short, long, value_enum, default_value_t = WindowArg::Trace)]
        window: WindowArg,
        /// Log buffer format.
        #[arg(short = 's', long = "stream", value_enum, default_value_t = FormatArg::Winstream)]
        format: FormatArg,
        /// Also service IPC commands from the firmware.
        #[arg(long)]
        ipc: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum WindowArg {
    Trace,
    Debug,
}

impl From<WindowArg> for LogWindow {
    fn from(arg: WindowArg) -> Self {
        match arg {
            WindowArg::Trace => Self::Trace,
            WindowArg::Debug => Self::Debug,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Winstream,
    Mtrace,
}

impl From<FormatArg> for LogFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Winstream => Self::Winstream,
            FormatArg::Mtrace => Self::Mtrace,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    install_sigint()?;

    match cli.command {
        Cmd::Load { ref fw_file } => cmd_load(&cli, fw_file)?,
        Cmd::Log {
            no_history,
            window,
            format,
            ipc,
        } => {
            let history = if no_history {
                HistoryMode::SkipHistory
            } else {
                HistoryMode::Replay
            };
            cmd_log(&cli, window.into(), format.into(), history, ipc)?;
        }
    }

    Ok(())
}

extern "C" fn on_sigint(_: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn install_sigint() -> Result<()> {
    let handler = on_sigint as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        bail!("Cannot install SIGINT handler: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

fn locate(cli: &Cli) -> Result<PathBuf> {
    if let Some(dir) = &cli.pci_dir {
        return Ok(dir.clone());
    }
    let device = discovery::find_first().context("No Intel audio DSP found")?;
    if let Some(generation) = device.generation() {
        info!("Found {generation} device at {}", device.address);
    }
    Ok(device.pci_dir)
}

fn open(pci_dir: &Path) -> Result<AdspDevice> {
    AdspDevice::open(pci_dir, HwTiming::default())
        .with_context(|| format!("Cannot open DSP at {}", pci_dir.display()))
}

fn cmd_load(cli: &Cli, fw_file: &Path) -> Result<()> {
    let pci_dir = locate(cli)?;
    DeviceSetup::new(&pci_dir).run()?;
    ensure_hugetlbfs(HugePageAllocator::from_env().dir())?;

    let dev = open(&pci_dir)?;
    let report = dev
        .load_firmware_file(fw_file, &BootConfig::default())
        .with_context(|| format!("Firmware load of {} failed", fw_file.display()))?;
    info!(
        "Loaded {} bytes in {:.3}s, FW_STATUS {:#x}",
        report.image_len,
        report.elapsed.as_secs_f64(),
        report.fw_status
    );

    let mut ipc = IpcDispatcher::new(&dev);
    ipc.settle();
    if !cli.quiet {
        println!("--");
    }
    ipc.service_pending().context("Post-load IPC drain failed")?;
    Ok(())
}

fn cmd_log(
    cli: &Cli,
    window: LogWindow,
    format: LogFormat,
    history: HistoryMode,
    ipc: bool,
) -> Result<()> {
    let pci_dir = locate(cli)?;
    DeviceSetup::new(&pci_dir).readonly(true).run()?;
    let dev = open(&pci_dir)?;

    if dev.wait_fw_entered(None, Some(&STOP)) == PollOutcome::Stopped {
        return Ok(());
    }

    let reader = open_reader(dev.bar4(), window, format, history)?;
    let mut tail = LogTail::new(reader, dev.timing().log_poll_interval).with_stop_flag(&STOP);
    if ipc {
        let mut dispatcher = IpcDispatcher::new(&dev)
            .with_dead_core_policy(DeadCorePolicy::AwaitReentry)
            .with_stop_flag(&STOP);
        tail = tail.with_idle_hook(move || dispatcher.poll_once().map(|_| ()));
    }

    for chunk in tail {
        let chunk = chunk.context("Log read failed")?;
        let mut out = std::io::stdout().lock();
        out.write_all(decode_text(&chunk).as_bytes())?;
        out.flush()?;
    }
    Ok(())
}
