//! Atomic regfile read-modify-write semantics.

use std::cell::RefCell;
use std::rc::Rc;

use raysim_core::mem::transaction::{MemOp, MemoryRequest};
use raysim_core::sim::Simulator;
use raysim_core::units::atomic_regfile::UnitAtomicRegfile;

use crate::common::mocks::client::ScriptedClient;

fn amo(op: MemOp, reg: u64, operand: u32, port: u16) -> MemoryRequest {
    MemoryRequest::amo(op, reg << 2, operand, port)
}

#[test]
fn fetch_and_add_returns_prior_values() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    let regs = Rc::new(RefCell::new(UnitAtomicRegfile::new(2)));

    let client = ScriptedClient::new(
        regs.clone(),
        vec![0, 1],
        vec![
            (0, amo(MemOp::AmoAdd, 0, 5, 0)),
            (0, amo(MemOp::AmoAdd, 0, 7, 1)),
        ],
        tracker,
    );

    sim.register_unit(regs.clone());
    sim.register_unit(client.clone());
    sim.execute(0, |_| {});

    let client = client.borrow();
    assert!(client.done());
    // One RMW per tick: the two priors are 0 and 5, in grant order.
    let mut priors: Vec<u32> = client.returns.iter().map(|(_, r)| r.data_u32()).collect();
    priors.sort_unstable();
    assert_eq!(priors, vec![0, 5]);
    assert_eq!(regs.borrow().iregs[0], 12);
}

#[test]
fn min_max_variants_respect_signedness() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    let regs = Rc::new(RefCell::new(UnitAtomicRegfile::new(1)));
    regs.borrow_mut().iregs[1] = -5i32 as u32;
    regs.borrow_mut().iregs[2] = 10;

    let client = ScriptedClient::new(
        regs.clone(),
        vec![0],
        vec![
            (0, amo(MemOp::AmoMax, 1, 3, 0)),
            (4, amo(MemOp::AmoMinu, 2, 4, 0)),
            (8, amo(MemOp::AmoXor, 2, 0xFF, 0)),
        ],
        tracker,
    );

    sim.register_unit(regs.clone());
    sim.register_unit(client.clone());
    sim.execute(0, |_| {});

    assert!(client.borrow().done());
    // Signed max of -5 and 3 is 3; unsigned min of 10 and 4 is 4.
    assert_eq!(regs.borrow().iregs[1], 3);
    assert_eq!(regs.borrow().iregs[2], 4 ^ 0xFF);
}

#[test]
fn stores_absorb_and_loads_observe() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    let regs = Rc::new(RefCell::new(UnitAtomicRegfile::new(1)));

    let store = MemoryRequest::store(3 << 2, &42u32.to_le_bytes(), 0);
    let client = ScriptedClient::new(
        regs.clone(),
        vec![0],
        vec![(0, store), (4, MemoryRequest::load(3 << 2, 4, 0))],
        tracker,
    );

    sim.register_unit(regs.clone());
    sim.register_unit(client.clone());
    sim.execute(0, |_| {});

    let client = client.borrow();
    assert!(client.done());
    assert_eq!(client.returns.len(), 1);
    assert_eq!(client.returns[0].1.data_u32(), 42);
}
