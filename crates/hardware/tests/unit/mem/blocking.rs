//! Blocking cache behavior.

use std::cell::RefCell;
use std::rc::Rc;

use raysim_core::mem::cache::{CacheConfig, UnitBlockingCache};
use raysim_core::mem::ports::MemHandle;
use raysim_core::mem::transaction::MemoryRequest;
use raysim_core::sim::Simulator;

use crate::common::mocks::client::ScriptedClient;
use crate::common::mocks::memory::MockMemory;

fn config(mem: MemHandle) -> CacheConfig {
    CacheConfig {
        size: 2048,
        associativity: 2,
        block_size: 64,
        num_banks: 2,
        bank_select_mask: 0,
        num_ports: 2,
        num_mshr: 0,
        latency: 1,
        crossbar_width: 2,
        retired_lfb_check: false,
        mem_higher: mem,
        mem_higher_port_offset: 0,
        mem_higher_port_stride: 1,
    }
}

#[test]
fn bank_stalls_on_miss_then_services_in_order() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();

    let mut memory = MockMemory::new(1 << 16, 2, 25);
    memory.load_image(&[3; 64], 0x000);
    memory.load_image(&[4; 64], 0x400);
    let memory = Rc::new(RefCell::new(memory));
    let cache = Rc::new(RefCell::new(UnitBlockingCache::new(&config(memory.clone()))));

    // Both loads map to bank 0 (bank select bits above the block offset);
    // the second waits for the first miss to fill.
    let client = ScriptedClient::new(
        cache.clone(),
        vec![0],
        vec![
            (0, MemoryRequest::load(0x000, 4, 0)),
            (0, MemoryRequest::load(0x400, 4, 0)),
        ],
        tracker,
    );

    sim.register_unit(memory.clone());
    sim.register_unit(cache.clone());
    sim.register_unit(client.clone());
    sim.execute(0, |_| {});

    let client = client.borrow();
    assert!(client.done());
    assert_eq!(client.returns.len(), 2);
    assert_eq!(client.returns[0].1.payload(), &[3; 4]);
    assert_eq!(client.returns[1].1.payload(), &[4; 4]);
    // Strict order on one (source, sink) pair.
    assert!(client.returns[0].0 < client.returns[1].0);
    assert_eq!(memory.borrow().loads, 2);
    assert_eq!(cache.borrow().log.misses, 2);
}

#[test]
fn second_access_to_filled_line_hits() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();

    let mut memory = MockMemory::new(1 << 16, 2, 25);
    memory.load_image(&[8; 64], 0x000);
    let memory = Rc::new(RefCell::new(memory));
    let cache = Rc::new(RefCell::new(UnitBlockingCache::new(&config(memory.clone()))));

    let client = ScriptedClient::new(
        cache.clone(),
        vec![0],
        vec![
            (0, MemoryRequest::load(0x000, 4, 0)),
            (60, MemoryRequest::load(0x020, 4, 0)),
        ],
        tracker,
    );

    sim.register_unit(memory.clone());
    sim.register_unit(cache.clone());
    sim.register_unit(client.clone());
    sim.execute(0, |_| {});

    let client = client.borrow();
    assert!(client.done());
    assert_eq!(memory.borrow().loads, 1);
    assert_eq!(cache.borrow().log.hits, 1);
    assert_eq!(cache.borrow().log.misses, 1);
}
