//! Streaming (treelet) ray-traversal core.
//!
//! Unlike the direct core, slots here do not receive rays from the TPs:
//! every slot continuously pulls ray work items from the TM's staging
//! buffer. A work item pins a ray to one treelet; traversal stays inside
//! that treelet, and a child pointer that crosses into another treelet is
//! not followed but re-emitted as a fresh work item for the scheduler to
//! coalesce. When the slot's stack drains it stores its hit record (if it
//! found one) and pulls the next work item; an invalid-segment work item
//! retires the slot.
//!
//! With early termination enabled, a slot first fetches the ray's global
//! hit record and starts with its `t`, so entries already beaten by
//! another TM's result pop-cull immediately.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::Serialize;

use super::ray_staging::UnitRayStagingBuffer;
use crate::common::bits::BitStack58;
use crate::common::track::WorkTracker;
use crate::common::Paddr;
use crate::mem::ports::{MemHandle, MemUnit};
use crate::mem::transaction::{MemOp, MemoryRequest, MemoryReturn};
use crate::net::{Cascade, FifoArray, Pipeline};
use crate::rt::bvh::ChildData;
use crate::rt::geom::{intersect_aabb, intersect_triangle, Hit, Ray, Vec3};
use crate::rt::treelet::{BucketRay, TreeletLayout, TreeletTriangle, WorkItem, INVALID_SEGMENT};
use crate::sim::Unit;

/// Traversal stack depth per unit of node width.
const STACK_DEPTH_PER_WIDTH: usize = 32;

const TRI_FETCH_TAG: u64 = 1 << 15;
const HIT_FETCH_TAG: u64 = 1 << 14;

/// Streaming RT core configuration.
pub struct TreeletRtCoreConfig {
    /// Ray slots.
    pub max_rays: usize,
    /// TP-facing ports.
    pub num_tp: usize,
    /// Base address of the treelet array.
    pub treelet_base_addr: Paddr,
    /// Base address of the global hit record array.
    pub hit_record_base_addr: Paddr,
    /// Treelet array layout.
    pub treelet_layout: TreeletLayout,
    /// Box pipeline latency in ticks.
    pub box_latency: u32,
    /// Triangle pipeline latency in ticks.
    pub tri_latency: u32,
    /// Triangle pipeline initiation interval in ticks.
    pub tri_issue_interval: u32,
    /// Cache line size, for splitting fetches.
    pub cache_block_size: u64,
    /// Seed each freshly pulled ray from its global hit record.
    pub use_early_termination: bool,
    /// This TM's staging buffer.
    pub staging: Rc<RefCell<UnitRayStagingBuffer>>,
    /// This core's port on the staging buffer.
    pub staging_port: usize,
    /// The cache this core fetches through.
    pub cache: MemHandle,
    /// This core's port on the cache.
    pub cache_port: usize,
    /// Units-executing tracker.
    pub tracker: WorkTracker,
}

/// Ray slot phase; also indexes the stall counters.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
enum Phase {
    Empty = 0,
    Scheduler = 1,
    RayFetch = 2,
    HitFetch = 3,
    HitUpdate = 4,
    NodeFetch = 5,
    TriFetch = 6,
    NodeIsect = 7,
    TriIsect = 8,
}

/// Number of phases, for the stall counter array.
pub const NUM_PHASES: usize = 9;

/// Names matching the stall counter slots.
pub const PHASE_NAMES: [&str; NUM_PHASES] = [
    "empty",
    "scheduler",
    "ray_fetch",
    "hit_fetch",
    "hit_update",
    "node_fetch",
    "tri_fetch",
    "node_isect",
    "tri_isect",
];

#[derive(Clone, Copy)]
struct StackEntry {
    t: f32,
    data: ChildData,
}

struct Staging {
    base: Paddr,
    expected: usize,
    filled: usize,
    buf: [u8; 384],
    tri_count: u32,
}

impl Staging {
    fn idle() -> Self {
        Self {
            base: 0,
            expected: 0,
            filled: 0,
            buf: [0; 384],
            tri_count: 0,
        }
    }
}

struct RayState {
    phase: Phase,
    ray: Ray,
    global_ray_id: u32,
    segment: u32,
    inv_d: Vec3,
    hit: Hit,
    /// A triangle of this treelet improved the hit.
    hit_found: bool,
    stack: Vec<StackEntry>,
    order_hint: u16,
    staging: Staging,
}

impl RayState {
    fn from_work_item(item: &WorkItem) -> Self {
        let ray = item.bray.ray;
        Self {
            phase: Phase::Scheduler,
            ray,
            global_ray_id: item.bray.id,
            segment: item.segment,
            inv_d: ray.dir.recip(),
            hit: Hit::miss(ray.t_max),
            hit_found: false,
            stack: vec![StackEntry {
                t: ray.t_min,
                data: ChildData::Node { index: 0 },
            }],
            order_hint: 0,
            staging: Staging::idle(),
        }
    }
}

/// Streaming-core traversal counters.
#[derive(Clone, Copy, Default, Serialize)]
pub struct TreeletRtCoreLog {
    /// Work items pulled from the staging buffer.
    pub rays: u64,
    /// Node intersections retired.
    pub nodes: u64,
    /// Triangle-group intersections retired.
    pub tris: u64,
    /// Work items re-emitted for treelet crossings.
    pub crossings: u64,
    /// Hit records stored.
    pub hits_stored: u64,
    /// Ticks a stalled slot spent in each phase while the scheduler had
    /// nothing to pop.
    pub stall_counters: [u64; NUM_PHASES],
}

impl TreeletRtCoreLog {
    /// Clears every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Adds `other` into this log.
    pub fn accumulate(&mut self, other: &Self) {
        self.rays += other.rays;
        self.nodes += other.nodes;
        self.tris += other.tris;
        self.crossings += other.crossings;
        self.hits_stored += other.hits_stored;
        for (mine, theirs) in self.stall_counters.iter_mut().zip(other.stall_counters.iter()) {
            *mine += theirs;
        }
    }
}

struct FetchItem {
    addr: Paddr,
    size: u8,
    dst: u64,
}

/// The streaming ray-traversal engine.
pub struct UnitTreeletRtCore {
    request_network: Cascade<MemoryRequest>,
    return_network: FifoArray<MemoryReturn>,
    staging: Rc<RefCell<UnitRayStagingBuffer>>,
    staging_port: usize,
    cache: MemHandle,
    cache_port: usize,

    ray_states: Vec<RayState>,
    ray_scheduling_queue: VecDeque<u16>,
    work_item_load_queue: VecDeque<u16>,
    work_item_store_queue: VecDeque<WorkItem>,
    hit_load_queue: VecDeque<u16>,
    hit_store_queue: VecDeque<u16>,
    fetch_queue: VecDeque<FetchItem>,

    node_isect_queue: VecDeque<u16>,
    box_pipeline: Pipeline<u16>,
    tri_isect_queue: VecDeque<u16>,
    tri_pipeline: Pipeline<u16>,
    tri_ii: u32,
    tri_ii_countdown: u32,

    treelet_base_addr: Paddr,
    hit_record_base_addr: Paddr,
    treelet_layout: TreeletLayout,
    stack_capacity: usize,
    cache_block_size: u64,
    use_early_termination: bool,
    last_ray_id: usize,
    active_slots: usize,
    tracker: WorkTracker,

    /// Traversal counters.
    pub log: TreeletRtCoreLog,
}

impl UnitTreeletRtCore {
    /// Creates the core; every slot starts hungry for a work item.
    pub fn new(config: TreeletRtCoreConfig) -> Self {
        let stack_capacity = STACK_DEPTH_PER_WIDTH * config.treelet_layout.node_layout.width;
        let mut work_item_load_queue = VecDeque::new();
        let ray_states = (0..config.max_rays)
            .map(|ray_id| {
                work_item_load_queue.push_back(ray_id as u16);
                let mut state = RayState::from_work_item(&WorkItem {
                    bray: BucketRay {
                        ray: Ray::default(),
                        id: 0,
                    },
                    segment: INVALID_SEGMENT,
                    order_hint: 0,
                });
                state.phase = Phase::RayFetch;
                state.stack.clear();
                state
            })
            .collect();

        config.tracker.incr();

        Self {
            request_network: Cascade::new(config.num_tp, 1),
            return_network: FifoArray::new(config.num_tp, 1),
            staging: config.staging,
            staging_port: config.staging_port,
            cache: config.cache,
            cache_port: config.cache_port,
            ray_states,
            ray_scheduling_queue: VecDeque::new(),
            work_item_load_queue,
            work_item_store_queue: VecDeque::new(),
            hit_load_queue: VecDeque::new(),
            hit_store_queue: VecDeque::new(),
            fetch_queue: VecDeque::new(),
            node_isect_queue: VecDeque::new(),
            box_pipeline: Pipeline::new(config.box_latency),
            tri_isect_queue: VecDeque::new(),
            tri_pipeline: Pipeline::new(config.tri_latency),
            tri_ii: config.tri_issue_interval.max(1),
            tri_ii_countdown: 0,
            treelet_base_addr: config.treelet_base_addr,
            hit_record_base_addr: config.hit_record_base_addr,
            treelet_layout: config.treelet_layout,
            stack_capacity,
            cache_block_size: config.cache_block_size,
            use_early_termination: config.use_early_termination,
            last_ray_id: 0,
            active_slots: config.max_rays,
            tracker: config.tracker,
            log: TreeletRtCoreLog::default(),
        }
    }

    fn block_floor(&self, addr: Paddr) -> Paddr {
        addr & !(self.cache_block_size - 1)
    }

    fn queue_fetch(&mut self, start: Paddr, len: usize, dst: u64) {
        let end = start + len as u64;
        let mut addr = start;
        while addr < end {
            let boundary = end.min(self.block_floor(addr) + self.cache_block_size);
            self.fetch_queue.push_back(FetchItem {
                addr,
                size: (boundary - addr) as u8,
                dst,
            });
            addr = boundary;
        }
    }

    fn queue_node(&mut self, ray_id: u16, node_index: u32) {
        let segment = self.ray_states[ray_id as usize].segment;
        let addr = self
            .treelet_layout
            .node_paddr(self.treelet_base_addr, segment, node_index);
        let bytes = self.treelet_layout.node_layout.node_bytes();
        self.ray_states[ray_id as usize].staging = Staging {
            base: addr,
            expected: bytes,
            filled: 0,
            buf: [0; 384],
            tri_count: 0,
        };
        self.queue_fetch(addr, bytes, u64::from(ray_id));
    }

    fn queue_tris(&mut self, ray_id: u16, byte_offset: u32, count: u32) {
        let segment = self.ray_states[ray_id as usize].segment;
        let addr = self
            .treelet_layout
            .body_paddr(self.treelet_base_addr, segment, byte_offset);
        let bytes = TreeletTriangle::BYTES * count as usize;
        self.ray_states[ray_id as usize].staging = Staging {
            base: addr,
            expected: bytes,
            filled: 0,
            buf: [0; 384],
            tri_count: count,
        };
        self.queue_fetch(addr, bytes, u64::from(ray_id) | TRI_FETCH_TAG);
    }

    fn read_requests(&mut self) {
        if !self.request_network.is_read_valid(0) {
            return;
        }
        let request = self.request_network.read(0);
        assert!(
            request.op == MemOp::Store && request.size as usize == WorkItem::BYTES,
            "streaming core accepts work-item stores only"
        );
        self.work_item_store_queue
            .push_back(WorkItem::read_from(request.payload()));
    }

    fn read_staging_returns(&mut self) {
        let readable = self.staging.borrow().return_port_read_valid(self.staging_port);
        if !readable {
            return;
        }
        let ret = self.staging.borrow_mut().read_return(self.staging_port);
        assert!(ret.size as usize == WorkItem::BYTES);

        let item = WorkItem::read_from(ret.payload());
        let ray_id = ret.dst.tag_value() as u16;
        if item.segment == INVALID_SEGMENT {
            self.ray_states[ray_id as usize].phase = Phase::Empty;
            self.active_slots -= 1;
            if self.active_slots == 0 {
                self.tracker.decr();
            }
            return;
        }

        self.ray_states[ray_id as usize] = RayState::from_work_item(&item);
        if self.use_early_termination {
            self.ray_states[ray_id as usize].phase = Phase::HitFetch;
            self.hit_load_queue.push_back(ray_id);
        } else {
            self.ray_scheduling_queue.push_back(ray_id);
        }
        self.log.rays += 1;
    }

    fn read_cache_returns(&mut self) {
        if !self.cache.borrow().return_port_read_valid(self.cache_port) {
            return;
        }
        let ret = self.cache.borrow_mut().read_return(self.cache_port);
        let tag = ret.dst.tag_value();
        let ray_id = (tag & !(TRI_FETCH_TAG | HIT_FETCH_TAG)) as u16;

        if tag & HIT_FETCH_TAG != 0 {
            let state = &mut self.ray_states[ray_id as usize];
            let global = Hit::read_from(ret.payload());
            if global.t < state.hit.t {
                // A better bound from another TM; adopt it so already
                // beaten stack entries pop-cull.
                state.hit = global;
                state.hit_found = false;
            }
            state.phase = Phase::Scheduler;
            self.ray_scheduling_queue.push_back(ray_id);
            return;
        }

        let state = &mut self.ray_states[ray_id as usize];
        let offset = (ret.paddr - state.staging.base) as usize;
        state.staging.buf[offset..offset + ret.size as usize].copy_from_slice(ret.payload());
        state.staging.filled += ret.size as usize;
        if state.staging.filled < state.staging.expected {
            return;
        }

        if tag & TRI_FETCH_TAG != 0 {
            state.phase = Phase::TriIsect;
            self.tri_isect_queue.push_back(ray_id);
        } else {
            state.phase = Phase::NodeIsect;
            self.node_isect_queue.push_back(ray_id);
        }
    }

    fn schedule_ray(&mut self) {
        let Some(ray_id) = self.ray_scheduling_queue.pop_front() else {
            return;
        };
        let state = &mut self.ray_states[ray_id as usize];

        if state.stack.is_empty() {
            if state.hit_found {
                state.phase = Phase::HitUpdate;
                self.hit_store_queue.push_back(ray_id);
            } else {
                state.phase = Phase::RayFetch;
                self.work_item_load_queue.push_back(ray_id);
            }
            return;
        }

        let entry = *state.stack.last().expect("nonempty checked");
        if entry.t >= state.hit.t {
            let _ = state.stack.pop();
            self.ray_scheduling_queue.push_back(ray_id);
            return;
        }

        match entry.data {
            ChildData::TreeletChild { index } => {
                // Do not follow the link; hand the ray back to the
                // scheduler targeted at the child treelet.
                let mut ray = state.ray;
                ray.t_max = ray.t_max.min(state.hit.t);
                let item = WorkItem {
                    bray: BucketRay {
                        ray,
                        id: state.global_ray_id,
                    },
                    segment: index,
                    order_hint: state.order_hint,
                };
                state.order_hint += 1;
                let _ = state.stack.pop();
                self.work_item_store_queue.push_back(item);
                self.ray_scheduling_queue.push_back(ray_id);
                self.log.crossings += 1;
            }
            ChildData::Node { index } => {
                state.phase = Phase::NodeFetch;
                let _ = state.stack.pop();
                self.queue_node(ray_id, index);
            }
            ChildData::Leaf { first, count } => {
                state.phase = Phase::TriFetch;
                let _ = state.stack.pop();
                self.queue_tris(ray_id, first, count);
            }
            ChildData::Empty => unreachable!("empty slots are never pushed"),
        }
    }

    fn simulate_node_pipeline(&mut self) {
        if !self.node_isect_queue.is_empty() && self.box_pipeline.is_write_valid() {
            let ray_id = self.node_isect_queue.pop_front().expect("checked above");
            let node = {
                let state = &self.ray_states[ray_id as usize];
                self.treelet_layout.read_node(&state.staging.buf)
            };
            let state = &mut self.ray_states[ray_id as usize];
            let floor = state.stack.len();
            for slot in 0..self.treelet_layout.node_layout.width {
                if node.data[slot] == ChildData::Empty {
                    continue;
                }
                let t = intersect_aabb(&node.aabb[slot], &state.ray, state.inv_d);
                if t < state.hit.t {
                    assert!(
                        state.stack.len() < self.stack_capacity,
                        "ray stack overflow at depth {}",
                        state.stack.len()
                    );
                    let mut at = state.stack.len();
                    state.stack.push(StackEntry { t, data: node.data[slot] });
                    while at > floor && state.stack[at - 1].t <= t {
                        state.stack.swap(at, at - 1);
                        at -= 1;
                    }
                }
            }
            self.box_pipeline.write(ray_id);
        }

        self.box_pipeline.clock();

        if self.box_pipeline.is_read_valid() {
            let ray_id = self.box_pipeline.read();
            self.ray_states[ray_id as usize].phase = Phase::Scheduler;
            self.ray_scheduling_queue.push_back(ray_id);
            self.log.nodes += 1;
        }
    }

    fn simulate_tri_pipeline(&mut self) {
        self.tri_ii_countdown = self.tri_ii_countdown.saturating_sub(1);
        if self.tri_ii_countdown == 0 {
            if let Some(&ray_id) = self.tri_isect_queue.front() {
                if self.tri_pipeline.is_write_valid() {
                    let state = &mut self.ray_states[ray_id as usize];
                    for i in 0..state.staging.tri_count as usize {
                        let at = i * TreeletTriangle::BYTES;
                        let record =
                            TreeletTriangle::read_from(&state.staging.buf[at..at + TreeletTriangle::BYTES]);
                        if intersect_triangle(&record.tri, &state.ray, &mut state.hit) {
                            state.hit.prim_id = record.id;
                            state.hit_found = true;
                        }
                    }
                    self.tri_pipeline.write(ray_id);
                    let _ = self.tri_isect_queue.pop_front();
                    self.tri_ii_countdown = self.tri_ii;
                }
            }
        }

        self.tri_pipeline.clock();

        if self.tri_pipeline.is_read_valid() {
            let ray_id = self.tri_pipeline.read();
            self.ray_states[ray_id as usize].phase = Phase::Scheduler;
            self.ray_scheduling_queue.push_back(ray_id);
            self.log.tris += 1;
        }
    }

    fn hit_record_paddr(&self, global_ray_id: u32) -> Paddr {
        self.hit_record_base_addr + u64::from(global_ray_id) * Hit::BYTES as u64
    }

    fn issue_cache_requests(&mut self) {
        if !self.cache.borrow().request_port_write_valid(self.cache_port) {
            return;
        }

        // Hit stores drain first so a slot's record lands before its rays
        // surface anywhere else.
        if let Some(&ray_id) = self.hit_store_queue.front() {
            let state = &mut self.ray_states[ray_id as usize];
            let mut bytes = [0u8; Hit::BYTES];
            state.hit.write_to(&mut bytes);
            let addr = self.hit_record_base_addr + u64::from(state.global_ray_id) * Hit::BYTES as u64;
            let request = MemoryRequest::store(addr, &bytes, self.cache_port as u16);
            state.phase = Phase::RayFetch;
            let _ = self.hit_store_queue.pop_front();
            self.work_item_load_queue.push_back(ray_id);
            self.cache.borrow_mut().write_request(request);
            self.log.hits_stored += 1;
            return;
        }

        if let Some(&ray_id) = self.hit_load_queue.front() {
            let addr = self.hit_record_paddr(self.ray_states[ray_id as usize].global_ray_id);
            let mut request = MemoryRequest::load(addr, Hit::BYTES, self.cache_port as u16);
            request.dst = BitStack58::tag(u64::from(ray_id) | HIT_FETCH_TAG);
            let _ = self.hit_load_queue.pop_front();
            self.cache.borrow_mut().write_request(request);
            return;
        }

        if let Some(item) = self.fetch_queue.pop_front() {
            let mut request = MemoryRequest::load(item.addr, item.size as usize, self.cache_port as u16);
            request.dst = BitStack58::tag(item.dst);
            self.cache.borrow_mut().write_request(request);
        }
    }

    fn issue_staging_requests(&mut self) {
        let writable = self.staging.borrow().request_port_write_valid(self.staging_port);
        if !writable {
            return;
        }

        // Crossing stores go ahead of loads so a ray's emitted work lands
        // before any slot asks for its next item.
        if let Some(item) = self.work_item_store_queue.pop_front() {
            let mut bytes = [0u8; WorkItem::BYTES];
            item.write_to(&mut bytes);
            let request = MemoryRequest::store(0, &bytes, self.staging_port as u16);
            self.staging.borrow_mut().write_request(request);
            return;
        }

        if let Some(&ray_id) = self.work_item_load_queue.front() {
            let mut request = MemoryRequest::load(0, WorkItem::BYTES, self.staging_port as u16);
            request.dst = BitStack58::tag(u64::from(ray_id));
            let _ = self.work_item_load_queue.pop_front();
            self.staging.borrow_mut().write_request(request);
        }
    }

    fn log_stalls(&mut self) {
        if !self.ray_scheduling_queue.is_empty() {
            return;
        }
        for _ in 0..self.ray_states.len() {
            let phase = self.ray_states[self.last_ray_id].phase;
            self.last_ray_id = (self.last_ray_id + 1) % self.ray_states.len();
            if phase != Phase::Empty {
                self.log.stall_counters[phase as usize] += 1;
                break;
            }
        }
    }
}

impl Unit for UnitTreeletRtCore {
    fn clock_rise(&mut self) {
        self.request_network.clock();
        self.read_requests();
        self.read_staging_returns();
        self.read_cache_returns();
        self.log_stalls();
        self.schedule_ray();
        self.simulate_node_pipeline();
        self.simulate_tri_pipeline();
    }

    fn clock_fall(&mut self) {
        self.issue_cache_requests();
        self.issue_staging_requests();
        self.return_network.clock();
    }

    fn reset(&mut self) {
        self.log.reset();
    }
}

impl MemUnit for UnitTreeletRtCore {
    fn request_port_write_valid(&self, port: usize) -> bool {
        self.request_network.is_write_valid(port)
    }

    fn write_request(&mut self, request: MemoryRequest) {
        self.request_network.write(request, request.port as usize);
    }

    fn return_port_read_valid(&self, port: usize) -> bool {
        self.return_network.is_read_valid(port)
    }

    fn peek_return(&self, port: usize) -> &MemoryReturn {
        self.return_network.peek(port)
    }

    fn read_return(&mut self, port: usize) -> MemoryReturn {
        self.return_network.read(port)
    }
}
