//! Engine tests against the emulated card
//!
//! Memory registration atomicity, pin/map rollback, transfer bounds and
//! the exact register programming of a submit.

use bdma_chip::regs::{self, engine};
use bdma_chip::PAGE_SIZE;
use bdma_driver::emulated::{EmulatedFunction, FaultPlan, HostEvent, RegWrite};
use bdma_driver::{BdmaError, Device, DriverConfig, ErrorKind, Operation};
use std::sync::Arc;

const BUF: u64 = 0x7f00_0010_0000;

fn bring_up(channels: usize) -> (EmulatedFunction, Device) {
    let bus = EmulatedFunction::new();
    let config = DriverConfig {
        channels,
        map_user_window: false,
        ..DriverConfig::default()
    };
    let device = Device::create(Arc::new(bus.clone()), config).expect("emulated bring-up");
    (bus, device)
}

fn table(bus: &EmulatedFunction, channel: usize) -> Vec<u64> {
    (0..regs::MAX_PAGES).map(|i| bus.table_entry(channel, i)).collect()
}

#[test]
fn valid_registrations_cover_the_buffer() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();

    for addr in [BUF, BUF + 1, BUF + 0xFFF, BUF + 0x800] {
        let max = regs::MAX_PAGES as u64 * PAGE_SIZE - (addr % PAGE_SIZE);
        for len in [PAGE_SIZE + 1, 2 * PAGE_SIZE, 0x3_0000 + 7, max] {
            let region = engine.register(addr, len).unwrap();
            assert!(region.head_page() <= addr);
            assert!(addr + len <= region.tail_page());
            assert!(region.pages() <= regs::MAX_PAGES);
            assert_eq!(engine.status(), (region.head_page(), region.len()));
            assert_eq!(bus.pinned_pages(), region.pages());
            assert_eq!(bus.live_mappings(), region.pages());
        }
    }
}

#[test]
fn one_page_or_less_is_rejected() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();
    bus.clear_control_writes();

    for len in [0, 1, 8, PAGE_SIZE] {
        let err = engine.register(BUF, len).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
    assert!(!engine.is_registered());
    assert_eq!(bus.pinned_pages(), 0);
    assert!(bus.control_writes().is_empty());
}

#[test]
fn too_many_pages_leaves_engine_untouched() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();
    engine.register(BUF, 5 * PAGE_SIZE).unwrap();

    let status = engine.status();
    let before = table(&bus, 0);
    let pinned = bus.pinned_pages();
    bus.clear_control_writes();

    let cases = [
        (BUF, (regs::MAX_PAGES as u64 + 1) * PAGE_SIZE),
        (BUF + 0x800, regs::MAX_PAGES as u64 * PAGE_SIZE),
        (BUF, 1 << 32),
    ];
    for (addr, len) in cases {
        let err = engine.register(addr, len).unwrap_err();
        assert!(matches!(err, BdmaError::ResourceExhausted { .. }), "{err}");
    }

    assert_eq!(engine.status(), status);
    assert_eq!(table(&bus, 0), before);
    assert_eq!(bus.pinned_pages(), pinned);
    assert!(bus.control_writes().is_empty());
}

#[test]
fn short_pin_releases_every_page() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();

    for limit in [0, 1, 3, 7] {
        bus.set_faults(FaultPlan {
            pin_limit: Some(limit),
            ..FaultPlan::default()
        });
        let err = engine.register(BUF, 8 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, BdmaError::Fault { .. }), "{err}");
        assert_eq!(bus.pinned_pages(), 0, "pin leak with limit {limit}");
        assert_eq!(bus.live_mappings(), 0);
        assert!(!engine.is_registered());
    }
}

#[test]
fn map_failure_unwinds_in_reverse() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();
    let pages = 8;

    for k in [0, 1, 4, pages - 1] {
        bus.set_faults(FaultPlan {
            fail_map_after: Some(k),
            ..FaultPlan::default()
        });
        bus.clear_control_writes();
        let events_before = bus.events().len();

        let err = engine.register(BUF, pages as u64 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, BdmaError::Fault { .. }), "{err}");
        assert_eq!(bus.live_mappings(), 0);
        assert_eq!(bus.pinned_pages(), 0);
        assert!(!engine.is_registered());
        assert!(bus.control_writes().is_empty(), "table written after failure at {k}");
        assert_eq!(table(&bus, 0), vec![0; regs::MAX_PAGES]);

        let events = bus.events().split_off(events_before);
        let mapped: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                HostEvent::MapPage(_, bus) => Some(*bus),
                _ => None,
            })
            .collect();
        let unmapped: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                HostEvent::UnmapPage(bus) => Some(*bus),
                _ => None,
            })
            .collect();
        assert_eq!(mapped.len(), k);
        let mut reversed = mapped.clone();
        reversed.reverse();
        assert_eq!(unmapped, reversed);
        assert!(matches!(events.last(), Some(HostEvent::Unpin(_, n)) if *n == pages));
    }
}

#[test]
fn table_is_written_low_then_high_per_page() {
    let (bus, device) = bring_up(2);
    let engine = device.engine(1).unwrap();
    bus.clear_control_writes();

    let region = engine.register(BUF, 3 * PAGE_SIZE).unwrap();
    let base = regs::table_base(1);
    let writes = bus.control_writes();
    assert_eq!(writes.len(), 2 * region.pages());

    for (page, pair) in writes.chunks(2).enumerate() {
        let bus_addr = bus.table_entry(1, page);
        assert_ne!(bus_addr, 0);
        assert_eq!(
            pair,
            [
                RegWrite {
                    offset: base + regs::table_entry_lo(page),
                    value: (bus_addr & 0xFFFF_FFFF) as u32,
                },
                RegWrite {
                    offset: base + regs::table_entry_hi(page),
                    value: (bus_addr >> 32) as u32,
                },
            ]
        );
    }
    assert_eq!(bus.table_entry(0, 0), 0, "other channel's table untouched");
}

#[test]
fn out_of_region_submits_write_nothing() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();

    bus.clear_control_writes();
    let err = engine.submit(BUF, 8, Operation::Read).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(bus.control_writes().is_empty());

    let region = engine.register(BUF, 2 * PAGE_SIZE).unwrap();
    let (head, tail) = (region.head_page(), region.tail_page());
    bus.clear_control_writes();

    let cases = [
        (head - 8, 8),
        (head - 1, 2),
        (tail - 7, 8),
        (tail, 1),
        (tail + 4, 0),
        (head, 2 * PAGE_SIZE + 1),
        (head + 8, u64::MAX),
    ];
    for (addr, len) in cases {
        for op in [Operation::Read, Operation::Write] {
            let err = engine.submit(addr, len, op).unwrap_err();
            assert!(
                matches!(err, BdmaError::InvalidArgument { .. }),
                "{addr:#x}+{len:#x}: {err}"
            );
        }
    }
    assert!(bus.control_writes().is_empty());
}

#[test]
fn register_memory_is_not_a_transfer() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();
    engine.register(BUF, 2 * PAGE_SIZE).unwrap();
    bus.clear_control_writes();

    let err = engine.submit(BUF, 8, Operation::RegisterMemory).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(bus.control_writes().is_empty());
}

#[test]
fn read_then_write_program_offsets_and_doorbell() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();

    engine.register(BUF, 8192).unwrap();
    bus.clear_control_writes();

    engine.submit(BUF, 8, Operation::Read).unwrap();
    engine.submit(BUF + 8184, 8, Operation::Write).unwrap();

    let block = regs::engine_block(0);
    let w = |slot: usize, value: u32| RegWrite {
        offset: block + slot,
        value,
    };
    assert_eq!(
        bus.control_writes(),
        [
            w(engine::DESC_ADDR_LO, 0),
            w(engine::DESC_ADDR_HI, 0),
            w(engine::DESC_LEN, 8),
            w(engine::DOORBELL, 0),
            w(engine::DESC_ADDR_LO, 8184),
            w(engine::DESC_ADDR_HI, 0),
            w(engine::DESC_LEN, 8),
            w(engine::DOORBELL, 1),
        ]
    );
}

#[test]
fn offsets_are_relative_to_the_page_aligned_head() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();

    let addr = BUF + 0x123;
    engine.register(addr, 2 * PAGE_SIZE).unwrap();
    bus.clear_control_writes();
    engine.submit(addr + 0x10, 0x40, Operation::Write).unwrap();

    let writes = bus.control_writes();
    assert_eq!(writes[0].value, 0x133);
    assert_eq!(writes[2].value, 0x40);
}

#[test]
fn reregistration_replaces_and_releases() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();

    engine.register(BUF, 8 * PAGE_SIZE).unwrap();
    let old: Vec<u64> = bus.mapped_bus_addrs();
    assert_eq!(old.len(), 8);

    let other = BUF + 0x100_0000;
    let region = engine.register(other, 3 * PAGE_SIZE).unwrap();
    assert_eq!(bus.pinned_pages(), 3);
    assert_eq!(bus.live_mappings(), 3);
    assert!(bus.mapped_bus_addrs().iter().all(|a| !old.contains(a)));
    assert_eq!(engine.status(), (other, 3 * PAGE_SIZE));
    assert_eq!(region.head_page(), other);

    let entries = table(&bus, 0);
    assert_eq!(&entries[..3], bus.mapped_bus_addrs().as_slice());
    assert!(entries[3..].iter().all(|&e| e == 0), "stale entries zeroed");
}

#[test]
fn failed_reregistration_keeps_previous_region() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();

    engine.register(BUF, 4 * PAGE_SIZE).unwrap();
    let status = engine.status();
    let before = table(&bus, 0);

    bus.set_faults(FaultPlan {
        fail_map_after: Some(2),
        ..FaultPlan::default()
    });
    let err = engine.register(BUF + 0x10_0000, 6 * PAGE_SIZE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fault);

    assert_eq!(engine.status(), status);
    assert_eq!(table(&bus, 0), before);
    assert_eq!(bus.pinned_pages(), 4);
    assert_eq!(bus.live_mappings(), 4);

    bus.set_faults(FaultPlan::default());
    engine.submit(BUF + PAGE_SIZE, 16, Operation::Read).unwrap();
}

#[test]
fn unregister_zeroes_table_and_releases() {
    let (bus, device) = bring_up(1);
    let engine = device.engine(0).unwrap();

    engine.unregister();
    engine.register(BUF, 5 * PAGE_SIZE).unwrap();
    engine.unregister();

    assert!(!engine.is_registered());
    assert_eq!(engine.status(), (0, 0));
    assert_eq!(table(&bus, 0), vec![0; regs::MAX_PAGES]);
    assert_eq!(bus.pinned_pages(), 0);
    assert_eq!(bus.live_mappings(), 0);
    assert!(engine.submit(BUF, 8, Operation::Read).is_err());
}

#[test]
fn channels_are_independent() {
    let (bus, device) = bring_up(4);
    let a = device.engine(0).unwrap();
    let b = device.engine(3).unwrap();

    a.register(BUF, 2 * PAGE_SIZE).unwrap();
    assert!(!b.is_registered());
    assert!(b.submit(BUF, 8, Operation::Read).is_err());

    b.register(BUF + 0x10_0000, 3 * PAGE_SIZE).unwrap();
    assert_eq!(bus.pinned_pages(), 5);
    assert_eq!(a.registered_pages(), 2);
    assert_eq!(b.registered_pages(), 3);
    assert_ne!(bus.table_entry(0, 0), bus.table_entry(3, 0));
}

#[test]
fn concurrent_submits_are_serialized_per_engine() {
    let (bus, device) = bring_up(1);
    let device = Arc::new(device);
    device.engine(0).unwrap().register(BUF, 4 * PAGE_SIZE).unwrap();
    bus.clear_control_writes();

    let threads: Vec<_> = (0..4u64)
        .map(|t| {
            let device = Arc::clone(&device);
            std::thread::spawn(move || {
                for i in 0..16u64 {
                    let offset = (t * 16 + i) * 8;
                    device
                        .engine(0)
                        .unwrap()
                        .submit(BUF + offset, 8, Operation::Write)
                        .unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let writes = bus.control_writes();
    assert_eq!(writes.len(), 64 * 4);
    for submit in writes.chunks(4) {
        let slots: Vec<usize> = submit.iter().map(|w| w.offset).collect();
        assert_eq!(
            slots,
            [
                engine::DESC_ADDR_LO,
                engine::DESC_ADDR_HI,
                engine::DESC_LEN,
                engine::DOORBELL
            ]
        );
    }
}

#[test]
fn registration_never_interleaves_with_submission() {
    let (bus, device) = bring_up(1);
    let device = Arc::new(device);
    device.engine(0).unwrap().register(BUF, 4 * PAGE_SIZE).unwrap();
    bus.clear_control_writes();

    let rounds = 64;
    let registrar = {
        let device = Arc::clone(&device);
        std::thread::spawn(move || {
            for i in 0..rounds {
                let pages = if i % 2 == 0 { 2 } else { 4 };
                device
                    .engine(0)
                    .unwrap()
                    .register(BUF, pages * PAGE_SIZE)
                    .unwrap();
            }
        })
    };
    let submitter = {
        let device = Arc::clone(&device);
        std::thread::spawn(move || {
            for i in 0..rounds {
                let op = if i % 2 == 0 { Operation::Read } else { Operation::Write };
                device.engine(0).unwrap().submit(BUF + 8, 8, op).unwrap();
            }
        })
    };
    registrar.join().unwrap();
    submitter.join().unwrap();

    let block = regs::engine_block(0);
    let tables = regs::table_base(0);
    let writes = bus.control_writes();
    let mut submits = 0;
    let mut i = 0;
    while i < writes.len() {
        if writes[i].offset >= tables {
            i += 1;
            continue;
        }
        let group: Vec<usize> = writes[i..(i + 4).min(writes.len())]
            .iter()
            .map(|w| w.offset - block)
            .collect();
        assert_eq!(
            group,
            [
                engine::DESC_ADDR_LO,
                engine::DESC_ADDR_HI,
                engine::DESC_LEN,
                engine::DOORBELL
            ],
            "submit split at write {i}"
        );
        submits += 1;
        i += 4;
    }
    assert_eq!(submits, rounds);
    assert_eq!(bus.pinned_pages(), 4);
}
