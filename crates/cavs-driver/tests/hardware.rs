//! Hardware validation
//!
//! Run as root on a machine with a cAVS DSP:
//! `cargo test -p cavs-driver --test hardware -- --ignored`

use cavs_driver::log::open_reader;
use cavs_driver::prelude::*;
use cavs_driver::{discovery, setup::DeviceSetup};

#[test]
#[ignore] // Requires hardware
fn discovers_a_supported_dsp() {
    let info = discovery::find_first().expect("no audio DSP");
    println!("DSP at {} class {:#08x}", info.address, info.class);
    println!("  device id: {:x?}", info.device_id);
    println!("  driver: {:?}", info.driver_module);
    assert!(info.generation().is_some(), "unsupported device id");
}

#[test]
#[ignore] // Requires hardware
fn maps_bars_and_reads_power_state() {
    let info = discovery::find_first().expect("no audio DSP");
    DeviceSetup::new(&info.pci_dir)
        .readonly(true)
        .run()
        .expect("PCI setup");
    let dev = AdspDevice::open(&info.pci_dir, HwTiming::default()).expect("open");
    println!("{} output stream {}", dev.generation(), dev.output_stream());
    println!("  state {:?}, FW_STATUS {:#x}", dev.dsp_state(), dev.fw_status());
    assert!(dev.output_stream() > 0);
}

#[test]
#[ignore] // Requires hardware and firmware in CAVS_TEST_FIRMWARE
fn boots_firmware_and_reads_log() {
    let firmware = std::env::var("CAVS_TEST_FIRMWARE").expect("CAVS_TEST_FIRMWARE not set");
    let info = discovery::find_first().expect("no audio DSP");
    DeviceSetup::new(&info.pci_dir).run().expect("PCI setup");
    let dev = AdspDevice::open(&info.pci_dir, HwTiming::default()).expect("open");

    let report = dev
        .load_firmware_file(std::path::Path::new(&firmware), &BootConfig::default())
        .expect("firmware load");
    println!("Booted in {:?}", report.elapsed);
    assert!(dev.fw_is_alive());

    let mut ipc = IpcDispatcher::new(&dev);
    ipc.settle();
    ipc.service_pending().expect("post-load drain");

    let mut reader = open_reader(
        dev.bar4(),
        LogWindow::Trace,
        LogFormat::Winstream,
        HistoryMode::Replay,
    )
    .expect("log window");
    std::thread::sleep(std::time::Duration::from_millis(500));
    let chunk = reader.read_chunk().expect("log read");
    println!("{:?}", chunk.map(|c| String::from_utf8_lossy(&c).into_owned()));
}
