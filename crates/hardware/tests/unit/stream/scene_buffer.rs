//! Scene buffer slot management and dynamic prefetch.

use std::cell::RefCell;
use std::rc::Rc;

use raysim_core::mem::dram::{DramConfig, UnitDram};
use raysim_core::mem::transaction::MemoryRequest;
use raysim_core::sim::Simulator;
use raysim_core::units::scene_buffer::{SceneBufferConfig, UnitSceneBuffer};

use crate::common::mocks::client::ScriptedClient;

const TREELET_ADDR: u64 = 0x10000;
const TREELET_BYTES: u64 = 8192;

fn build(dynamic: bool, tracker: raysim_core::common::track::WorkTracker) -> (
    Rc<RefCell<UnitDram>>,
    Rc<RefCell<UnitSceneBuffer>>,
) {
    let dram_config = DramConfig {
        num_channels: 1,
        num_ranks: 1,
        num_banks: 8,
        size: 1 << 20,
        clock_multiplier: 1,
        ..DramConfig::default()
    };
    let row_size = dram_config.row_size();
    let dram = Rc::new(RefCell::new(UnitDram::new(1, dram_config, tracker)));

    // A recognizable pattern across the treelet body.
    let image: Vec<u8> = (0..TREELET_BYTES).map(|i| (i / 64) as u8).collect();
    dram.borrow_mut().direct_write(&image, TREELET_ADDR);

    let scene_buffer = Rc::new(RefCell::new(UnitSceneBuffer::new(SceneBufferConfig {
        size: TREELET_BYTES,
        num_ports: 2,
        num_banks: 1,
        bank_select_mask: 0,
        treelet_bytes: TREELET_BYTES,
        segment_start: TREELET_ADDR,
        num_channels: 1,
        row_size,
        block_size: 64,
        latency: 1,
        dynamic_prefetch: dynamic,
        prefetch_blocks: 4,
        main_mem: dram.clone(),
        main_mem_port_offset: 0,
        main_mem_port_stride: 1,
    })));

    (dram, scene_buffer)
}

#[test]
fn eager_prefetch_fills_whole_treelet_then_serves_reads() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    let (dram, scene_buffer) = build(false, tracker.clone());

    scene_buffer.borrow_mut().prefetch_sideband.write((0, 1.0));

    let client = ScriptedClient::new(
        scene_buffer.clone(),
        vec![0],
        // Well after the fill: a read from the middle of the treelet.
        vec![(400, MemoryRequest::load(TREELET_ADDR + 4096, 64, 0))],
        tracker,
    );

    sim.register_unit(dram.clone());
    sim.register_unit(scene_buffer.clone());
    sim.register_unit(client.clone());
    sim.execute(0, |_| {});

    let client = client.borrow();
    assert!(client.done());
    assert_eq!(client.returns[0].1.payload(), &[(4096 / 64) as u8; 64]);

    // The whole treelet streamed in, and completion was signaled.
    assert_eq!(dram.borrow().log.loads, TREELET_BYTES / 64);
    assert!(scene_buffer.borrow_mut().prefetch_complete_sideband.is_read_valid());
    assert_eq!(scene_buffer.borrow_mut().prefetch_complete_sideband.read(), 0);
}

#[test]
fn dynamic_prefetch_half_miss_waits_without_rerequest() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    let (dram, scene_buffer) = build(true, tracker.clone());

    // Ratio 1/8: only the leading 1 KiB streams eagerly.
    scene_buffer.borrow_mut().prefetch_sideband.write((0, 0.125));

    // Two reads of one cold block from different ports: the first is a
    // miss that triggers on-demand completion, the second a half miss that
    // must not issue another memory request.
    let cold = TREELET_ADDR + 4096;
    let client = ScriptedClient::new(
        scene_buffer.clone(),
        vec![0, 1],
        vec![
            (50, MemoryRequest::load(cold, 64, 0)),
            (51, MemoryRequest::load(cold, 64, 1)),
        ],
        tracker,
    );

    sim.register_unit(dram.clone());
    sim.register_unit(scene_buffer.clone());
    sim.register_unit(client.clone());
    sim.execute(0, |_| {});

    let client = client.borrow();
    assert!(client.done());
    assert_eq!(client.returns.len(), 2);
    for (_, ret) in &client.returns {
        assert_eq!(ret.payload(), &[(4096 / 64) as u8; 64]);
    }

    let log = scene_buffer.borrow().log;
    assert_eq!(log.read_misses, 1, "the second read is a half miss");

    // Eager span (16 blocks) plus one on-demand completion of
    // `prefetch_blocks` blocks; the half miss adds nothing.
    assert_eq!(dram.borrow().log.loads, 16 + 4);
}

#[test]
#[should_panic(expected = "not resident")]
fn unmapped_segment_access_is_fatal() {
    let tracker = raysim_core::common::track::WorkTracker::new();
    let (_dram, scene_buffer) = build(false, tracker);

    // No prefetch was ever issued for segment 1.
    let mut sb = scene_buffer.borrow_mut();
    use raysim_core::mem::ports::MemUnit;
    use raysim_core::sim::Unit;
    sb.write_request(MemoryRequest::load(TREELET_ADDR + TREELET_BYTES + 64, 64, 0));
    sb.clock_rise();
}
