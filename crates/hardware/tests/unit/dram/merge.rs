//! Read/write queue merging.

use std::cell::RefCell;
use std::rc::Rc;

use raysim_core::mem::dram::{DramConfig, UnitDram};
use raysim_core::mem::transaction::MemoryRequest;
use raysim_core::sim::Simulator;

use crate::common::mocks::client::ScriptedClient;

fn config() -> DramConfig {
    DramConfig {
        num_channels: 1,
        num_ranks: 1,
        num_banks: 4,
        size: 1 << 20,
        clock_multiplier: 1,
        ..DramConfig::default()
    }
}

#[test]
fn read_coalesces_into_queued_read() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    let dram = Rc::new(RefCell::new(UnitDram::new(2, config(), tracker.clone())));
    dram.borrow_mut().direct_write(&[0x11; 64], 0x40);

    let client = ScriptedClient::new(
        dram.clone(),
        vec![0, 1],
        vec![
            (0, MemoryRequest::load(0x40, 64, 0)),
            (0, MemoryRequest::load(0x40, 64, 1)),
        ],
        tracker,
    );

    sim.register_unit(dram.clone());
    sim.register_unit(client.clone());
    sim.execute(0, |_| {});

    let client = client.borrow();
    assert!(client.done());
    assert_eq!(client.returns.len(), 2);
    let log = dram.borrow().log;
    assert_eq!(log.read_merges, 1);
    // One column command served both waiters.
    assert_eq!(log.row_hits, 1);
}

#[test]
fn read_forwards_from_queued_write() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    let dram = Rc::new(RefCell::new(UnitDram::new(2, config(), tracker.clone())));

    let client = ScriptedClient::new(
        dram.clone(),
        vec![0, 1],
        vec![
            (0, MemoryRequest::store(0x80, &[0x77; 64], 0)),
            (1, MemoryRequest::load(0x80, 64, 1)),
        ],
        tracker,
    );

    sim.register_unit(dram.clone());
    sim.register_unit(client.clone());
    sim.execute(0, |_| {});

    let client = client.borrow();
    assert!(client.done());
    let log = dram.borrow().log;
    assert_eq!(log.write_forwards, 1, "the read must be answered out of the write queue");
    assert_eq!(client.returns[0].1.payload(), &[0x77; 64]);
}

#[test]
fn writes_to_one_block_merge() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    let dram = Rc::new(RefCell::new(UnitDram::new(1, config(), tracker.clone())));

    let client = ScriptedClient::new(
        dram.clone(),
        vec![0],
        vec![
            (0, MemoryRequest::store(0xC0, &[1; 64], 0)),
            (1, MemoryRequest::store(0xC0, &[2; 64], 0)),
        ],
        tracker,
    );

    sim.register_unit(dram.clone());
    sim.register_unit(client.clone());
    sim.execute(0, |_| {});

    assert!(client.borrow().done());
    let log = dram.borrow().log;
    assert_eq!(log.write_merges, 1);
    assert_eq!(dram.borrow().direct_read(0xC0, 64), &[2; 64]);
}
