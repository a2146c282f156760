//! Refresh window coverage.

use std::cell::RefCell;
use std::rc::Rc;

use raysim_core::mem::dram::{DramConfig, DramTiming, UnitDram};
use raysim_core::sim::Simulator;

/// Every refresh window of `8 * t_refi` owes exactly eight auto-refresh
/// commands per rank, whether the channel is busy or idle.
#[test]
fn eight_refreshes_per_window_per_rank() {
    let timing = DramTiming {
        t_refi: 500,
        t_rfc: 60,
        ..DramTiming::default()
    };
    let config = DramConfig {
        num_channels: 1,
        num_ranks: 2,
        num_banks: 4,
        size: 1 << 20,
        clock_multiplier: 1,
        timing,
        ..DramConfig::default()
    };

    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    let dram = Rc::new(RefCell::new(UnitDram::new(1, config, tracker)));
    sim.register_unit(dram.clone());

    let window = 8 * timing.t_refi;
    let windows = 3u64;
    for _ in 0..window * windows {
        sim.tick();
    }

    // Two ranks, three complete windows, eight refreshes each.
    assert_eq!(dram.borrow().log.refreshes, 8 * 2 * windows);
}

/// A window under continuous load still gets its eight refreshes; the
/// deadline forces them in over the traffic.
#[test]
fn forced_refresh_preempts_traffic() {
    use raysim_core::mem::transaction::MemoryRequest;

    use crate::common::mocks::client::ScriptedClient;

    let timing = DramTiming {
        t_refi: 400,
        t_rfc: 50,
        ..DramTiming::default()
    };
    let config = DramConfig {
        num_channels: 1,
        num_ranks: 1,
        num_banks: 4,
        size: 1 << 20,
        clock_multiplier: 1,
        timing,
        ..DramConfig::default()
    };

    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    let dram = Rc::new(RefCell::new(UnitDram::new(1, config, tracker.clone())));

    // A steady stream of row-conflicting reads across the whole window.
    let window = 8 * timing.t_refi;
    let script: Vec<_> = (0..64u64)
        .map(|i| {
            let addr = (i % 2) * 8192 + (i / 2) * 64;
            (i * (window / 64), MemoryRequest::load(addr, 64, 0))
        })
        .collect();
    let client = ScriptedClient::new(dram.clone(), vec![0], script, tracker);

    sim.register_unit(dram.clone());
    sim.register_unit(client.clone());

    for _ in 0..window {
        sim.tick();
    }

    assert_eq!(dram.borrow().log.refreshes, 8);
}
