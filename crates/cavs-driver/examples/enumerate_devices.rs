//! List the audio DSPs on this system
//!
//! Reads sysfs only; no root needed.

use cavs_driver::{discovery, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("cavs_driver=debug")
        .init();

    let devices = discovery::discover()?;
    println!("Found {} audio DSP function(s):\n", devices.len());

    for device in &devices {
        println!("{}:", device.address);
        println!("   Path:       {}", device.pci_dir.display());
        println!("   Class:      {:#08x}", device.class);
        match (device.device_id, device.generation()) {
            (Some(id), Some(generation)) => println!("   Device:     {id:#06x} ({generation})"),
            (Some(id), None) => println!("   Device:     {id:#06x} (unsupported)"),
            (None, _) => println!("   Device:     unreadable"),
        }
        println!(
            "   Driver:     {}",
            device.driver_module.as_deref().unwrap_or("none")
        );
        println!();
    }

    Ok(())
}
