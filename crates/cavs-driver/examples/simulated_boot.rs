//! Boot a firmware image on the simulated device and answer one command
//!
//! Shows the full host-side flow without hardware:
//! `cargo run -p cavs-driver --example simulated_boot`

use cavs_chip::pcie::ChipGeneration;
use cavs_driver::sim::SimulatedAdsp;
use cavs_driver::{BootConfig, HwTiming, IpcDispatcher, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("cavs_driver=info")
        .init();

    let sim = SimulatedAdsp::new(ChipGeneration::Cavs25);
    let dev = sim.device(HwTiming::immediate())?;

    let mut image = b"XMan".to_vec();
    image.extend_from_slice(&8u32.to_le_bytes());
    image.extend(std::iter::repeat(0x5a).take(4096));

    let report = dev.load_firmware(&image, &BootConfig::default())?;
    println!(
        "Booted {} bytes ({} manifest bytes skipped), state {:?}",
        report.image_len,
        report.manifest_len,
        dev.dsp_state()
    );

    // The "firmware" asks for an echo
    sim.post_command(2, 0xcafe);
    let mut ipc = IpcDispatcher::new(&dev);
    ipc.poll_once()?;
    println!("Reply: {:#x}", sim.peek(cavs_driver::sim::SimBar::Bar4, sim.layout().hipcidd));

    Ok(())
}
