//! End-to-end streaming traversal: TPs park rays, the scheduler buckets
//! them, and the treelet RT core traverses and stores hit records.

use std::cell::RefCell;
use std::rc::Rc;

use raysim_core::common::track::WorkTracker;
use raysim_core::mem::dram::{DramConfig, UnitDram};
use raysim_core::mem::ports::MemUnit;
use raysim_core::mem::transaction::MemoryRequest;
use raysim_core::rt::geom::{Hit, Ray, Vec3};
use raysim_core::rt::treelet::{BucketRay, TreeletLayout, TreeletTriangle, WorkItem};
use raysim_core::sim::{Simulator, Unit};
use raysim_core::units::ray_staging::UnitRayStagingBuffer;
use raysim_core::units::stream_scheduler::{
    StreamSchedulerConfig, TraversalScheme, UnitStreamScheduler, WeightScheme,
};
use raysim_core::units::treelet_rt_core::{TreeletRtCoreConfig, UnitTreeletRtCore};

use crate::common::harness::{encode_leaf_treelet, facing_triangle, header};
use crate::common::mocks::memory::MockMemory;

const TREELET_ADDR: u64 = 0x10000;
const HIT_BASE: u64 = 0x30000;
const HEAP_ADDR: u64 = 0x40000;
const TREELET_BYTES: u64 = 8192;
const NUM_RAYS: usize = 8;
const PRIM_ID: u32 = 11;

/// Stores the root work items, then goes quiet; the RT core's slots do the
/// rest of the talking.
struct RayGenerator {
    staging: Rc<RefCell<UnitRayStagingBuffer>>,
    items: Vec<WorkItem>,
    stored: usize,
    started: bool,
    tracker: WorkTracker,
}

impl Unit for RayGenerator {
    fn clock_rise(&mut self) {}

    fn clock_fall(&mut self) {
        if !self.started {
            self.started = true;
            self.tracker.incr();
        }
        if self.stored == self.items.len() {
            return;
        }
        if self.staging.borrow().request_port_write_valid(0) {
            let mut bytes = [0u8; WorkItem::BYTES];
            self.items[self.stored].write_to(&mut bytes);
            self.staging.borrow_mut().write_request(MemoryRequest::store(0, &bytes, 0));
            self.stored += 1;
            if self.stored == self.items.len() {
                self.tracker.decr();
            }
        }
    }
}

#[test]
fn rays_bucket_traverse_and_store_hits() {
    crate::common::harness::init_tracing();

    let mut sim = Simulator::new();
    let tracker = sim.tracker();

    let dram_config = DramConfig {
        num_channels: 1,
        num_ranks: 1,
        num_banks: 8,
        size: 1 << 20,
        clock_multiplier: 1,
        ..DramConfig::default()
    };
    let row_size = dram_config.row_size();
    let dram = Rc::new(RefCell::new(UnitDram::new(1, dram_config, tracker.clone())));

    // The treelet bytes live both in DRAM (for completeness) and in the
    // core-side cache stand-in it actually fetches through.
    let layout = TreeletLayout::new(TREELET_BYTES, 2);
    let image = encode_leaf_treelet(
        &layout,
        &header(0, 0, 0, 1.0),
        TreeletTriangle {
            tri: facing_triangle(5.0),
            id: PRIM_ID,
        },
    );
    let mut cache = MockMemory::new(1 << 18, 1, 3);
    cache.load_image(&image, TREELET_ADDR);
    let cache = Rc::new(RefCell::new(cache));

    let scheduler = Rc::new(RefCell::new(UnitStreamScheduler::new(StreamSchedulerConfig {
        treelet_addr: TREELET_ADDR,
        heap_addr: HEAP_ADDR,
        treelet_headers: vec![header(0, 0, 0, 1.0)],
        treelet_layout: layout,
        num_root_rays: NUM_RAYS as u64,
        num_tms: 1,
        num_banks: 2,
        num_channels: 1,
        row_size,
        block_size: 64,
        traversal_scheme: TraversalScheme::Bfs,
        weight_scheme: WeightScheme::TotalWeight,
        max_active_segments: 16,
        // No scene buffer: segments become dispatchable as soon as they
        // are scheduled.
        scene_buffer: None,
        l2_cache: None,
        main_mem: dram.clone(),
        main_mem_port_offset: 0,
        main_mem_port_stride: 1,
        tracker: tracker.clone(),
    })));

    let staging = Rc::new(RefCell::new(UnitRayStagingBuffer::new(2, 0, scheduler.clone())));

    let core = Rc::new(RefCell::new(UnitTreeletRtCore::new(TreeletRtCoreConfig {
        max_rays: 4,
        num_tp: 1,
        treelet_base_addr: TREELET_ADDR,
        hit_record_base_addr: HIT_BASE,
        treelet_layout: layout,
        box_latency: 3,
        tri_latency: 22,
        tri_issue_interval: 8,
        cache_block_size: 64,
        use_early_termination: false,
        staging: staging.clone(),
        staging_port: 1,
        cache: cache.clone(),
        cache_port: 0,
        tracker: tracker.clone(),
    })));

    let generator = Rc::new(RefCell::new(RayGenerator {
        staging: staging.clone(),
        items: (0..NUM_RAYS)
            .map(|i| WorkItem {
                bray: BucketRay {
                    ray: Ray {
                        origin: Vec3::new(0.0, 0.0, 0.0),
                        t_min: 0.0,
                        dir: Vec3::new(0.0, 0.0, 1.0),
                        t_max: 100.0,
                    },
                    id: i as u32,
                },
                segment: 0,
                order_hint: 0,
            })
            .collect(),
        stored: 0,
        started: false,
        tracker: tracker.clone(),
    }));

    sim.register_unit(dram.clone());
    sim.register_unit(cache.clone());
    sim.register_unit(scheduler.clone());
    sim.register_unit(staging.clone());
    sim.register_unit(core.clone());
    sim.register_unit(generator.clone());
    sim.execute(0, |_| {});

    // Every ray found the triangle and stored its record in the global
    // hit array.
    for id in 0..NUM_RAYS as u32 {
        let at = HIT_BASE + u64::from(id) * Hit::BYTES as u64;
        let hit = Hit::read_from(cache.borrow().bytes(at, Hit::BYTES));
        assert_eq!(hit.prim_id, PRIM_ID, "ray {id} missed");
        assert!((hit.t - 5.0).abs() < 1e-5);
    }

    let core_log = core.borrow().log;
    assert_eq!(core_log.rays, NUM_RAYS as u64);
    assert_eq!(core_log.hits_stored, NUM_RAYS as u64);
    // Root and leaf node per ray.
    assert_eq!(core_log.nodes, 2 * NUM_RAYS as u64);
    assert_eq!(core_log.tris, NUM_RAYS as u64);
    assert_eq!(core_log.crossings, 0);

    let sched_log = scheduler.borrow().log;
    assert_eq!(sched_log.rays, NUM_RAYS as u64);
    assert_eq!(sched_log.buckets_generated, 1, "a partial bucket flushes when its parent finishes");
    assert_eq!(sched_log.buckets_launched, 1);
    assert!(scheduler.borrow().is_complete());

    // The aggregated report carries the run through to export.
    let mut stats = raysim_core::SimStats::new();
    stats.cycles = sim.current_cycle;
    stats.treelet_rt_cores.accumulate(&core_log);
    stats.stream_scheduler.accumulate(&sched_log);
    stats.dram.accumulate(&dram.borrow().log);
    let json = stats.to_json();
    assert!(json.contains("\"buckets_launched\": 1"));
    assert!(!stats.to_string().is_empty());
}
