//! Hardware validation tests
//!
//! Run with a card bound to `vfio-pci`:
//! `cargo test -p bdma-driver --test hardware_tests -- --ignored`

use bdma_chip::bar::Bar;
use bdma_chip::PAGE_SIZE;
use bdma_driver::{ControlHandle, DeviceManager, DriverConfig, Operation};
use std::io::SeekFrom;
use std::sync::Arc;

#[test]
#[ignore] // Requires hardware
fn test_discover_and_bring_up() {
    let manager = DeviceManager::discover().expect("discovery");
    let device = manager.open(0, DriverConfig::from_env()).expect("bring-up");
    println!(
        "{}: {} engines, {:?}",
        device.address(),
        device.engines().len(),
        device.dma_width()
    );
    assert!(!device.engines().is_empty());
}

#[test]
#[ignore] // Requires hardware
fn test_register_round_trip() {
    let manager = DeviceManager::discover().expect("discovery");
    let device = Arc::new(manager.open(0, DriverConfig::from_env()).expect("bring-up"));
    let mut h = ControlHandle::open(device, Bar::Control).expect("control handle");

    h.seek(SeekFrom::Start(0x800)).unwrap();
    h.write(&0xDEAD_BEEF_u32.to_ne_bytes()).unwrap();
    h.seek(SeekFrom::Start(0x800)).unwrap();
    let mut buf = [0u8; 4];
    h.read(&mut buf).unwrap();
    assert_eq!(u32::from_ne_bytes(buf), 0xDEAD_BEEF);
}

#[test]
#[ignore] // Requires hardware
fn test_register_and_submit() {
    let manager = DeviceManager::discover().expect("discovery");
    let device = manager.open(0, DriverConfig::from_env()).expect("bring-up");
    let engine = device.engine(0).expect("channel 0");

    let buffer = vec![0xA5u8; 2 * PAGE_SIZE as usize];
    let addr = buffer.as_ptr() as u64;
    let region = engine
        .register(addr, buffer.len() as u64)
        .expect("registration");
    println!(
        "registered {:#x}..{:#x} ({} pages)",
        region.head_page(),
        region.tail_page(),
        region.pages()
    );

    engine.submit(addr, 8, Operation::Read).expect("read");
    engine
        .submit(addr + buffer.len() as u64 - 8, 8, Operation::Write)
        .expect("write");
    engine.unregister();
}
