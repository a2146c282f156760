//! Direct ray-traversal core.
//!
//! The core owns a fixed pool of ray slots. A TP submits a ray through the
//! request network; the slot then cycles through scheduler, fetch, and
//! intersection phases until its traversal stack drains, at which point the
//! hit record returns to the issuing port and the slot frees. All node and
//! triangle bytes come through the core's cache port, split at cache-line
//! boundaries and reassembled in per-slot staging buffers.
//!
//! Back-pressure never drops a ray: a refused fetch or hit return retries
//! the next tick, and a full box or triangle pipeline simply leaves the
//! work queued.

use std::collections::VecDeque;

use serde::Serialize;

use crate::common::bits::BitStack58;
use crate::common::track::WorkTracker;
use crate::common::Paddr;
use crate::mem::ports::{MemHandle, MemUnit, RequestCascade, ReturnCascade};
use crate::mem::transaction::{flags, MemoryRequest, MemoryReturn};
use crate::net::Pipeline;
use crate::rt::bvh::{ChildData, WideBvhLayout, WideNode};
use crate::rt::geom::{intersect_aabb, intersect_triangle, Hit, Ray, Triangle, Vec3};
use crate::sim::Unit;

/// Traversal stack depth per unit of node width.
pub const STACK_DEPTH_PER_WIDTH: usize = 32;

const TRI_FETCH_TAG: u64 = 1 << 15;

/// Direct RT core configuration.
pub struct RtCoreConfig {
    /// Ray slots.
    pub max_rays: usize,
    /// TP-facing ports.
    pub num_tp: usize,
    /// Base address of the wide node array.
    pub node_base_addr: Paddr,
    /// Base address of the triangle array.
    pub tri_base_addr: Paddr,
    /// Node array layout.
    pub node_layout: WideBvhLayout,
    /// Box pipeline latency in ticks.
    pub box_latency: u32,
    /// Triangle pipeline latency in ticks.
    pub tri_latency: u32,
    /// Triangle pipeline initiation interval in ticks.
    pub tri_issue_interval: u32,
    /// Cache line size, for splitting fetches.
    pub cache_block_size: u64,
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
pub enum Phase {
    /// Slot free.
    Empty = 0,
    /// Waiting for a scheduler step.
    Scheduler = 1,
    /// Hit record waiting for the return network.
    HitReturn = 2,
    /// Node bytes in flight.
    NodeFetch = 3,
    /// Triangle bytes in flight.
    TriFetch = 4,
    /// Queued for or inside the box pipeline.
    NodeIsect = 5,
    /// Queued for or inside the triangle pipeline.
    TriIsect = 6,
}

/// Number of phases, for the stall counter array.
pub const NUM_PHASES: usize = 7;

/// Names matching the stall counter slots.
pub const PHASE_NAMES: [&str; NUM_PHASES] = [
    "empty",
    "scheduler",
    "hit_return",
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
    buf: [u8; 256],
    /// Primitive id of the staged triangle (triangle fetches only).
    prim_id: u32,
}

impl Staging {
    fn idle() -> Self {
        Self {
            base: 0,
            expected: 0,
            filled: 0,
            buf: [0; 256],
            prim_id: 0,
        }
    }
}

struct RayState {
    phase: Phase,
    ray: Ray,
    inv_d: Vec3,
    hit: Hit,
    stack: Vec<StackEntry>,
    flags: u16,
    port: u16,
    dst: BitStack58,
    staging: Staging,
}

struct FetchItem {
    addr: Paddr,
    size: u8,
    dst: u64,
}

/// Per-core traversal counters.
#[derive(Clone, Copy, Default, Serialize)]
pub struct RtCoreLog {
    /// Rays accepted.
    pub rays: u64,
    /// Node intersections retired.
    pub nodes: u64,
    /// Triangle intersections retired.
    pub tris: u64,
    /// Hit records returned.
    pub hits_returned: u64,
    /// Ticks a stalled slot spent in each phase while the scheduler had
    /// nothing to pop.
    pub stall_counters: [u64; NUM_PHASES],
}

impl RtCoreLog {
    /// Clears every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Adds `other` into this log.
    pub fn accumulate(&mut self, other: &Self) {
        self.rays += other.rays;
        self.nodes += other.nodes;
        self.tris += other.tris;
        self.hits_returned += other.hits_returned;
        for (mine, theirs) in self.stall_counters.iter_mut().zip(other.stall_counters.iter()) {
            *mine += theirs;
        }
    }
}

/// The direct ray-traversal engine.
pub struct UnitRtCore {
    request_network: RequestCascade,
    return_network: ReturnCascade,
    cache: MemHandle,
    cache_port: usize,

    ray_states: Vec<RayState>,
    free_ray_ids: Vec<u16>,
    ray_scheduling_queue: VecDeque<u16>,
    ray_return_queue: VecDeque<u16>,
    fetch_queue: VecDeque<FetchItem>,

    node_isect_queue: VecDeque<(u16, WideNode)>,
    box_pipeline: Pipeline<u16>,
    tri_isect_queue: VecDeque<u16>,
    tri_pipeline: Pipeline<u16>,
    tri_ii: u32,
    tri_ii_countdown: u32,

    node_base_addr: Paddr,
    tri_base_addr: Paddr,
    node_layout: WideBvhLayout,
    stack_capacity: usize,
    cache_block_size: u64,
    last_ray_id: usize,
    active_rays: usize,
    tracker: WorkTracker,

    /// Traversal counters.
    pub log: RtCoreLog,
}

impl UnitRtCore {
    /// Creates the core from its configuration.
    pub fn new(config: RtCoreConfig) -> Self {
        let stack_capacity = STACK_DEPTH_PER_WIDTH * config.node_layout.width;
        Self {
            request_network: RequestCascade::new(config.num_tp, 1),
            return_network: ReturnCascade::new(1, config.num_tp),
            cache: config.cache,
            cache_port: config.cache_port,
            ray_states: (0..config.max_rays)
                .map(|_| RayState {
                    phase: Phase::Empty,
                    ray: Ray::default(),
                    inv_d: Vec3::default(),
                    hit: Hit::miss(0.0),
                    stack: Vec::with_capacity(stack_capacity),
                    flags: 0,
                    port: 0,
                    dst: BitStack58::default(),
                    staging: Staging::idle(),
                })
                .collect(),
            free_ray_ids: (0..config.max_rays as u16).rev().collect(),
            ray_scheduling_queue: VecDeque::new(),
            ray_return_queue: VecDeque::new(),
            fetch_queue: VecDeque::new(),
            node_isect_queue: VecDeque::new(),
            box_pipeline: Pipeline::new(config.box_latency),
            tri_isect_queue: VecDeque::new(),
            tri_pipeline: Pipeline::new(config.tri_latency),
            tri_ii: config.tri_issue_interval.max(1),
            tri_ii_countdown: 0,
            node_base_addr: config.node_base_addr,
            tri_base_addr: config.tri_base_addr,
            node_layout: config.node_layout,
            stack_capacity,
            cache_block_size: config.cache_block_size,
            last_ray_id: 0,
            active_rays: 0,
            tracker: config.tracker,
            log: RtCoreLog::default(),
        }
    }

    fn block_floor(&self, addr: Paddr) -> Paddr {
        addr & !(self.cache_block_size - 1)
    }

    /// Splits `[start, start + len)` at cache-line boundaries into the
    /// fetch queue.
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
        let addr = self.node_layout.node_paddr(self.node_base_addr, node_index);
        let bytes = self.node_layout.node_bytes();
        self.ray_states[ray_id as usize].staging = Staging {
            base: addr,
            expected: bytes,
            filled: 0,
            buf: [0; 256],
            prim_id: 0,
        };
        self.queue_fetch(addr, bytes, u64::from(ray_id));
    }

    fn queue_tri(&mut self, ray_id: u16, tri_index: u32) {
        let addr = self.tri_base_addr + u64::from(tri_index) * Triangle::BYTES as u64;
        self.ray_states[ray_id as usize].staging = Staging {
            base: addr,
            expected: Triangle::BYTES,
            filled: 0,
            buf: [0; 256],
            prim_id: tri_index,
        };
        self.queue_fetch(addr, Triangle::BYTES, u64::from(ray_id) | TRI_FETCH_TAG);
    }

    fn read_requests(&mut self) {
        if !self.request_network.is_read_valid(0) || self.free_ray_ids.is_empty() {
            return;
        }
        let request = self.request_network.read(0);
        assert!(request.size as usize == Ray::BYTES, "RT core accepts ray submissions only");

        let ray_id = self.free_ray_ids.pop().expect("checked above");
        let state = &mut self.ray_states[ray_id as usize];
        state.ray = Ray::read_from(request.payload());
        state.inv_d = state.ray.dir.recip();
        state.hit = Hit::miss(state.ray.t_max);
        state.stack.clear();
        state.stack.push(StackEntry {
            t: state.ray.t_min,
            data: ChildData::Node { index: 0 },
        });
        state.flags = request.flags;
        state.port = request.port;
        state.dst = request.dst;
        state.phase = Phase::Scheduler;
        self.ray_scheduling_queue.push_back(ray_id);

        if self.active_rays == 0 {
            self.tracker.incr();
        }
        self.active_rays += 1;
        self.log.rays += 1;
    }

    fn read_returns(&mut self) {
        if !self.cache.borrow().return_port_read_valid(self.cache_port) {
            return;
        }
        let ret = self.cache.borrow_mut().read_return(self.cache_port);
        let tag = ret.dst.tag_value();
        let ray_id = (tag & !TRI_FETCH_TAG) as u16;
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
            let node = self.node_layout.read_node(&state.staging.buf);
            state.phase = Phase::NodeIsect;
            self.node_isect_queue.push_back((ray_id, node));
        }
    }

    fn schedule_ray(&mut self) {
        let Some(ray_id) = self.ray_scheduling_queue.pop_front() else {
            return;
        };
        let state = &mut self.ray_states[ray_id as usize];

        let any_hit_found = state.flags & flags::ANY_HIT != 0 && state.hit.is_hit();
        if any_hit_found || state.stack.is_empty() {
            state.phase = Phase::HitReturn;
            self.ray_return_queue.push_back(ray_id);
            return;
        }

        let entry = *state.stack.last().expect("nonempty checked");
        if entry.t >= state.hit.t {
            // Pop cull: a closer hit already bounds this subtree.
            let _ = state.stack.pop();
            self.ray_scheduling_queue.push_back(ray_id);
            return;
        }

        match entry.data {
            ChildData::Leaf { first, count } => {
                state.phase = Phase::TriFetch;
                if count == 1 {
                    let _ = state.stack.pop();
                } else {
                    let top = state.stack.last_mut().expect("nonempty checked");
                    top.data = ChildData::Leaf {
                        first: first + 1,
                        count: count - 1,
                    };
                }
                self.queue_tri(ray_id, first);
            }
            ChildData::Node { index } => {
                state.phase = Phase::NodeFetch;
                let _ = state.stack.pop();
                self.queue_node(ray_id, index);
            }
            ChildData::TreeletChild { .. } => {
                panic!("treelet crossing reached the direct core")
            }
            ChildData::Empty => unreachable!("empty slots are never pushed"),
        }
    }

    fn simulate_node_pipeline(&mut self) {
        if !self.node_isect_queue.is_empty() && self.box_pipeline.is_write_valid() {
            let (ray_id, node) = self.node_isect_queue.pop_front().expect("checked above");
            let state = &mut self.ray_states[ray_id as usize];
            let floor = state.stack.len();
            for slot in 0..self.node_layout.width {
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
                    // Sorted insertion into the prefix pushed by this node
                    // keeps the nearest child on top.
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
                    let tri = Triangle::read_from(&state.staging.buf[..Triangle::BYTES]);
                    if intersect_triangle(&tri, &state.ray, &mut state.hit) {
                        state.hit.prim_id = state.staging.prim_id;
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

    fn issue_requests(&mut self) {
        if self.fetch_queue.is_empty() || !self.cache.borrow().request_port_write_valid(self.cache_port) {
            return;
        }
        let item = self.fetch_queue.pop_front().expect("checked above");
        let mut request = MemoryRequest::load(item.addr, item.size as usize, self.cache_port as u16);
        request.dst = BitStack58::tag(item.dst);
        self.cache.borrow_mut().write_request(request);
    }

    fn issue_returns(&mut self) {
        let Some(&ray_id) = self.ray_return_queue.front() else {
            return;
        };
        if !self.return_network.is_write_valid(0) {
            return;
        }
        let state = &mut self.ray_states[ray_id as usize];
        let mut bytes = [0u8; Hit::BYTES];
        state.hit.write_to(&mut bytes);

        let mut ret = MemoryReturn::empty(state.port);
        ret.size = Hit::BYTES as u8;
        ret.dst = state.dst;
        ret.paddr = 0;
        ret.data[..Hit::BYTES].copy_from_slice(&bytes);
        self.return_network.write(ret, 0);

        state.phase = Phase::Empty;
        self.free_ray_ids.push(ray_id);
        let _ = self.ray_return_queue.pop_front();
        self.log.hits_returned += 1;
        self.active_rays -= 1;
        if self.active_rays == 0 {
            self.tracker.decr();
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

impl Unit for UnitRtCore {
    fn clock_rise(&mut self) {
        self.request_network.clock();
        self.read_requests();
        self.read_returns();
        self.log_stalls();
        self.schedule_ray();
        self.simulate_node_pipeline();
        self.simulate_tri_pipeline();
    }

    fn clock_fall(&mut self) {
        self.issue_requests();
        self.issue_returns();
        self.return_network.clock();
    }

    fn reset(&mut self) {
        self.log.reset();
    }
}

impl MemUnit for UnitRtCore {
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
