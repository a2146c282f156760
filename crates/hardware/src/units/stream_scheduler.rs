//! Stream scheduler: ray coalescing, segment lifecycle, and bucket
//! streaming.
//!
//! Three concurrent subsystems share the unit:
//! 1. **Ray coalescer.** Each bank keeps at most one partial bucket per
//!    segment. Incoming work items append to the partial bucket; a full
//!    bucket, or one flushed because its parent retired, moves to the write
//!    cascade. A bucket never reaches DRAM empty.
//! 2. **Segment lifecycle.** A segment appears when its first bucket is
//!    allocated, becomes a prefetch candidate, is pulled into the scene
//!    buffer (or straight into the L2 by the surface-area heuristic when no
//!    scene buffer is configured), hands its buckets out to requesting TMs,
//!    and retires once its parent is finished and every bucket came back.
//!    Candidate expansion follows breadth-first or weighted depth-first
//!    order and triggers when ready buckets fall below the low-water mark.
//! 3. **Channel machines.** One work queue per DRAM channel streams
//!    block-sized sub-requests until the 2 KiB bucket has moved.
//!
//! Buckets are allocated by per-channel bump allocators aligned to DRAM
//! rows and striped round-robin within a segment, so one segment's
//! bandwidth spans every channel. When the candidate set empties the
//! scheduler answers bucket requests with a size-0 return, which is the
//! simulation's termination signal.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tracing::{debug, trace};

use super::scene_buffer::UnitSceneBuffer;
use crate::common::bits::align_to;
use crate::common::track::WorkTracker;
use crate::common::Paddr;
use crate::mem::ports::{MemHandle, ReturnXbar};
use crate::mem::transaction::{MemoryRequest, MemoryReturn};
use crate::net::{Cascade, CascadedCrossbar};
use crate::rt::treelet::{RayBucket, StreamRequest, TreeletHeader, TreeletLayout, BUCKET_BYTES};
use crate::sim::Unit;

use std::cell::RefCell;
use std::rc::Rc;

/// Candidate expansion low-water mark, in ready buckets.
const BUCKETS_READY_LOW_WATER: usize = 16;
/// Concurrent scene buffer prefetches.
const MAX_CONCURRENT_PREFETCHES: usize = 4;

/// Order in which child segments become candidates.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum TraversalScheme {
    /// Children enqueue in index order.
    #[default]
    Bfs,
    /// Children push in weight-ascending order so the heaviest pops first.
    Dfs,
}

/// Weight used by depth-first expansion.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum WeightScheme {
    /// Total accumulated work-item weight.
    #[default]
    TotalWeight,
    /// Accumulated weight divided by ray count.
    AverageRayWeight,
    /// Zero weight for every child, which falls back to memory order.
    /// Reachable but experimental.
    MemoryOrder,
}

/// Stream scheduler configuration.
pub struct StreamSchedulerConfig {
    /// Base address of the treelet array.
    pub treelet_addr: Paddr,
    /// Base address of the bucket heap.
    pub heap_addr: Paddr,
    /// Treelet headers, indexed by segment id. Metadata side-band standing
    /// in for header fetches the hardware would cache.
    pub treelet_headers: Vec<TreeletHeader>,
    /// Treelet array layout.
    pub treelet_layout: TreeletLayout,
    /// Root rays the camera generator will store to segment zero.
    pub num_root_rays: u64,
    /// TM-facing ports.
    pub num_tms: usize,
    /// Coalescer banks.
    pub num_banks: usize,
    /// DRAM channels.
    pub num_channels: usize,
    /// DRAM row bytes.
    pub row_size: u64,
    /// Transfer block bytes.
    pub block_size: u64,
    /// Candidate expansion order.
    pub traversal_scheme: TraversalScheme,
    /// Depth-first weighting.
    pub weight_scheme: WeightScheme,
    /// Bound on simultaneously active segments.
    pub max_active_segments: usize,
    /// Scene buffer, when the configuration has one.
    pub scene_buffer: Option<Rc<RefCell<UnitSceneBuffer>>>,
    /// L2 cache port for heuristic prefetch when no scene buffer exists.
    pub l2_cache: Option<(MemHandle, usize)>,
    /// Backing DRAM.
    pub main_mem: MemHandle,
    /// First DRAM port reserved for this unit.
    pub main_mem_port_offset: usize,
    /// Stride between this unit's per-channel DRAM ports.
    pub main_mem_port_stride: usize,
    /// Units-executing tracker.
    pub tracker: WorkTracker,
}

/// Per-channel bucket allocator: bump allocation aligned to DRAM rows and
/// pinned to this channel's stripe, with a free list for retired buckets.
struct MemoryManager {
    next_bucket_addr: Paddr,
    num_channels: u64,
    row_size: u64,
    free_buckets: Vec<Paddr>,
}

impl MemoryManager {
    fn new(channel_index: u64, num_channels: u64, row_size: u64, start: Paddr) -> Self {
        let mut next = align_to(row_size, start);
        while (next / row_size) % num_channels != channel_index {
            next += row_size;
        }
        Self {
            next_bucket_addr: next,
            num_channels,
            row_size,
            free_buckets: Vec::new(),
        }
    }

    fn alloc_bucket(&mut self) -> Paddr {
        if let Some(addr) = self.free_buckets.pop() {
            return addr;
        }
        let addr = self.next_bucket_addr;
        self.next_bucket_addr += BUCKET_BYTES as u64;
        if self.next_bucket_addr % self.row_size == 0 {
            self.next_bucket_addr += (self.num_channels - 1) * self.row_size;
        }
        addr
    }

    fn free_bucket(&mut self, addr: Paddr) {
        self.free_buckets.push(addr);
    }

    fn channel_of(&self, addr: Paddr) -> usize {
        ((addr / self.row_size) % self.num_channels) as usize
    }
}

/// Lifecycle state of one live segment.
#[derive(Default)]
struct SegmentState {
    bucket_address_queue: VecDeque<Paddr>,
    next_channel: usize,
    total_buckets: u32,
    retired_buckets: u32,
    parent_finished: bool,
    prefetch_issued: bool,
    prefetch_complete: bool,
    child_order_generated: bool,
    weight: u64,
    num_rays: u64,
    scheduled_weight: u64,
    depth: u32,
}

struct Bank {
    bucket_flush_queue: VecDeque<u32>,
    ray_coalescer: BTreeMap<u32, RayBucket>,
}

enum ChannelWork {
    ReadBucket { addr: Paddr, dst_tm: u16 },
    WriteBucket { addr: Paddr, image: Box<[u8; BUCKET_BYTES]> },
}

struct Channel {
    work_queue: VecDeque<ChannelWork>,
    bytes_requested: u64,
    forward_return: Option<MemoryReturn>,
}

/// Stream scheduler counters.
#[derive(Clone, Copy, Default, Serialize)]
pub struct StreamSchedulerLog {
    /// Root rays stored.
    pub rays: u64,
    /// Work items stored (root rays plus treelet crossings).
    pub work_items: u64,
    /// Buckets handed to TMs.
    pub buckets_launched: u64,
    /// Buckets written toward DRAM.
    pub buckets_generated: u64,
    /// Segments that entered the prefetch stage.
    pub segments_launched: u64,
    /// Segments retiring after exactly one bucket.
    pub single_bucket_segments: u64,
}

impl StreamSchedulerLog {
    /// Clears every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Adds `other` into this log.
    pub fn accumulate(&mut self, other: &Self) {
        self.rays += other.rays;
        self.work_items += other.work_items;
        self.buckets_launched += other.buckets_launched;
        self.buckets_generated += other.buckets_generated;
        self.segments_launched += other.segments_launched;
        self.single_bucket_segments += other.single_bucket_segments;
    }
}

struct SchedulerState {
    bucket_allocated_queue: VecDeque<u32>,
    bucket_request_queue: VecDeque<u16>,
    bucket_complete_queue: VecDeque<u32>,
    bucket_write_cascade: Cascade<RayBucket>,

    last_segment_on_tm: Vec<u32>,
    segment_state_map: BTreeMap<u32, SegmentState>,

    memory_managers: Vec<MemoryManager>,

    candidate_segments: Vec<u32>,
    traversal_stack: Vec<u32>,
    traversal_queue: VecDeque<u32>,
    last_segment_activated: u32,

    scene_prefetch_queue: VecDeque<(u32, f32)>,
    scene_retire_queue: VecDeque<u32>,
    l2_prefetch_queue: VecDeque<Paddr>,

    root_rays_counter: u64,
    concurrent_prefetches: usize,
    active_segments: usize,
}

/// The stream scheduler unit.
pub struct UnitStreamScheduler {
    config_num_root_rays: u64,
    traversal_scheme: TraversalScheme,
    weight_scheme: WeightScheme,
    max_active_segments: usize,

    treelet_addr: Paddr,
    treelet_headers: Vec<TreeletHeader>,
    treelet_layout: TreeletLayout,
    block_size: u64,

    request_network: CascadedCrossbar<StreamRequest>,
    banks: Vec<Bank>,
    scheduler: SchedulerState,
    channels: Vec<Channel>,
    return_network: ReturnXbar,

    scene_buffer: Option<Rc<RefCell<UnitSceneBuffer>>>,
    l2_cache: Option<(MemHandle, usize)>,
    main_mem: MemHandle,
    main_mem_port_offset: usize,
    main_mem_port_stride: usize,

    tracker: WorkTracker,
    complete_reported: bool,

    /// Scheduler counters.
    pub log: StreamSchedulerLog,
}

impl UnitStreamScheduler {
    /// Creates the scheduler from its configuration.
    pub fn new(config: StreamSchedulerConfig) -> Self {
        let mut segment_state_map = BTreeMap::new();
        let _ = segment_state_map.insert(0, SegmentState::default());

        let scheduler = SchedulerState {
            bucket_allocated_queue: VecDeque::new(),
            bucket_request_queue: VecDeque::new(),
            bucket_complete_queue: VecDeque::new(),
            bucket_write_cascade: Cascade::new(config.num_banks, 1),
            last_segment_on_tm: vec![u32::MAX; config.num_tms],
            segment_state_map,
            memory_managers: (0..config.num_channels as u64)
                .map(|i| {
                    MemoryManager::new(i, config.num_channels as u64, config.row_size, config.heap_addr)
                })
                .collect(),
            candidate_segments: vec![0],
            traversal_stack: Vec::new(),
            traversal_queue: VecDeque::new(),
            last_segment_activated: 0,
            scene_prefetch_queue: VecDeque::new(),
            scene_retire_queue: VecDeque::new(),
            l2_prefetch_queue: VecDeque::new(),
            root_rays_counter: 0,
            concurrent_prefetches: 0,
            active_segments: 0,
        };

        config.tracker.incr();

        Self {
            config_num_root_rays: config.num_root_rays,
            traversal_scheme: config.traversal_scheme,
            weight_scheme: config.weight_scheme,
            max_active_segments: config.max_active_segments,
            treelet_addr: config.treelet_addr,
            treelet_headers: config.treelet_headers,
            treelet_layout: config.treelet_layout,
            block_size: config.block_size,
            request_network: CascadedCrossbar::new(config.num_tms, config.num_banks, config.num_banks, config.num_banks),
            banks: (0..config.num_banks)
                .map(|_| Bank {
                    bucket_flush_queue: VecDeque::new(),
                    ray_coalescer: BTreeMap::new(),
                })
                .collect(),
            scheduler,
            channels: (0..config.num_channels)
                .map(|_| Channel {
                    work_queue: VecDeque::new(),
                    bytes_requested: 0,
                    forward_return: None,
                })
                .collect(),
            return_network: ReturnXbar::new(config.num_channels, config.num_tms, 64),
            scene_buffer: config.scene_buffer,
            l2_cache: config.l2_cache,
            main_mem: config.main_mem,
            main_mem_port_offset: config.main_mem_port_offset,
            main_mem_port_stride: config.main_mem_port_stride,
            tracker: config.tracker,
            complete_reported: false,
            log: StreamSchedulerLog::default(),
        }
    }

    /// Returns `true` once every segment has retired.
    pub fn is_complete(&self) -> bool {
        self.scheduler.candidate_segments.is_empty()
    }

    /// Returns `true` when TM `port` can write a stream request this tick.
    /// Clock fall only.
    pub fn stream_port_write_valid(&self, port: usize) -> bool {
        self.request_network.is_write_valid(port)
    }

    /// Writes a stream request on the port it names. Clock fall only.
    pub fn write_stream_request(&mut self, request: StreamRequest) {
        self.request_network.write(request, request.port() as usize);
    }

    /// Returns `true` when TM `port` holds a bucket-block or termination
    /// return. Clock rise only.
    pub fn return_port_read_valid(&self, port: usize) -> bool {
        self.return_network.is_read_valid(port)
    }

    /// Returns a reference to the return at TM `port`. Clock rise only.
    pub fn peek_return(&self, port: usize) -> &MemoryReturn {
        self.return_network.peek(port)
    }

    /// Removes and returns the return at TM `port`. Clock rise only.
    pub fn read_return(&mut self, port: usize) -> MemoryReturn {
        self.return_network.read(port)
    }

    fn dram_port(&self, channel: usize) -> usize {
        self.main_mem_port_offset + channel * self.main_mem_port_stride
    }

    fn header(&self, segment: u32) -> TreeletHeader {
        self.treelet_headers[segment as usize]
    }

    fn process_request(&mut self, bank_index: usize) {
        // Parent-retire flushes drain ahead of new work so child buckets
        // reach DRAM promptly.
        while let Some(&flush_segment) = self.banks[bank_index].bucket_flush_queue.front() {
            if self.banks[bank_index].ray_coalescer.contains_key(&flush_segment) {
                if !self.scheduler.bucket_write_cascade.is_write_valid(bank_index) {
                    return;
                }
                let bucket = self.banks[bank_index]
                    .ray_coalescer
                    .remove(&flush_segment)
                    .expect("checked above");
                self.scheduler.bucket_write_cascade.write(bucket, bank_index);
                let _ = self.banks[bank_index].bucket_flush_queue.pop_front();
                return;
            }
            let _ = self.banks[bank_index].bucket_flush_queue.pop_front();
        }

        if !self.request_network.is_read_valid(bank_index) {
            return;
        }

        match *self.request_network.peek(bank_index) {
            StreamRequest::StoreWorkItem { item, .. } => {
                let segment = item.segment;
                let full = self.banks[bank_index]
                    .ray_coalescer
                    .get(&segment)
                    .is_some_and(RayBucket::is_full);
                if !full {
                    // Degenerate rays still count toward the root total but
                    // are not parked.
                    if item.bray.ray.t_min != item.bray.ray.t_max {
                        let bank = &mut self.banks[bank_index];
                        if !bank.ray_coalescer.contains_key(&segment) {
                            self.scheduler.bucket_allocated_queue.push_back(segment);
                            let _ = bank.ray_coalescer.insert(segment, RayBucket::new(segment));
                        }
                        bank.ray_coalescer
                            .get_mut(&segment)
                            .expect("inserted above")
                            .push(item.bray);

                        let weight = 1u64 << (15 - u32::from(item.order_hint.min(15)));
                        let state = self.scheduler.segment_state_map.entry(segment).or_default();
                        state.weight += weight;
                        state.num_rays += 1;

                        if segment == 0 {
                            self.log.rays += 1;
                        }
                    }

                    if segment == 0 {
                        self.scheduler.root_rays_counter += 1;
                    }
                    self.log.work_items += 1;
                    let _ = self.request_network.read(bank_index);
                }

                let now_full = self.banks[bank_index]
                    .ray_coalescer
                    .get(&segment)
                    .is_some_and(RayBucket::is_full);
                if now_full && self.scheduler.bucket_write_cascade.is_write_valid(bank_index) {
                    let bucket = self.banks[bank_index]
                        .ray_coalescer
                        .remove(&segment)
                        .expect("checked above");
                    self.scheduler.bucket_write_cascade.write(bucket, bank_index);
                }
            }
            StreamRequest::BucketComplete { segment, .. } => {
                self.scheduler.bucket_complete_queue.push_back(segment);
                let _ = self.request_network.read(bank_index);
            }
            StreamRequest::LoadBucket { port } => {
                self.scheduler.bucket_request_queue.push_back(port);
                let _ = self.request_network.read(bank_index);
            }
        }
    }

    fn process_return(&mut self, channel_index: usize) {
        let port = self.dram_port(channel_index);
        if self.channels[channel_index].forward_return.is_some()
            || !self.main_mem.borrow().return_port_read_valid(port)
        {
            return;
        }
        self.channels[channel_index].forward_return =
            Some(self.main_mem.borrow_mut().read_return(port));
    }

    /// Ray-count ratio handed to the scene buffer's dynamic prefetch: the
    /// fraction of pages worth touching given the expected accesses.
    fn prefetch_ratio(&self, segment: u32, rays: u64) -> f32 {
        let header = self.header(segment);
        let mut worthwhile = 0usize;
        for page_sah in header.page_sah {
            let accesses = rays as f32 * page_sah * 0.5;
            if accesses >= 1.0 {
                worthwhile += 1;
            }
        }
        (worthwhile.max(1) as f32) / header.page_sah.len() as f32
    }

    fn issue_prefetch(&mut self, segment: u32) {
        let rays = if segment == 0 {
            self.config_num_root_rays
        } else {
            self.scheduler.segment_state_map[&segment].num_rays
        };

        if self.scene_buffer.is_some() {
            self.scheduler.concurrent_prefetches += 1;
            let ratio = self.prefetch_ratio(segment, rays);
            self.scheduler.scene_prefetch_queue.push_back((segment, ratio));
        } else {
            self.scheduler
                .segment_state_map
                .get_mut(&segment)
                .expect("candidate has state")
                .prefetch_complete = true;

            if self.l2_cache.is_some() {
                // Per page, compare the streaming cost against the expected
                // cost of demand misses; prefetch the pages that lose.
                let header = self.header(segment);
                let base = self.treelet_layout.treelet_paddr(self.treelet_addr, segment);
                let page_bytes = self.treelet_layout.page_bytes();
                for (page, page_sah) in header.page_sah.iter().enumerate() {
                    let accesses = rays as f32 * page_sah * 0.5;
                    let first_access_chance = accesses.min(1.0);
                    let dram_stream_cost = 16.0;
                    let dram_random_cost = 64.0;
                    if dram_stream_cost - first_access_chance * dram_random_cost < 0.0 {
                        let mut offset = 0;
                        while offset < page_bytes {
                            self.scheduler
                                .l2_prefetch_queue
                                .push_back(base + page as u64 * page_bytes + offset);
                            offset += self.block_size;
                        }
                    }
                }
            }
        }

        self.log.segments_launched += 1;
    }

    /// The traversal logic: lifecycle updates and the decision of which
    /// bucket moves next.
    fn update_scheduler(&mut self) {
        // All root rays in: segment zero's parent is the camera.
        if self.scheduler.root_rays_counter == self.config_num_root_rays
            && self
                .scheduler
                .segment_state_map
                .get(&0)
                .is_some_and(|s| !s.parent_finished)
        {
            self.scheduler
                .segment_state_map
                .get_mut(&0)
                .expect("checked above")
                .parent_finished = true;
            for bank in &mut self.banks {
                bank.bucket_flush_queue.push_back(0);
            }
        }

        // New buckets allocated by the coalescer.
        while let Some(segment) = self.scheduler.bucket_allocated_queue.pop_front() {
            let channels = self.channels.len();
            let state = self.scheduler.segment_state_map.entry(segment).or_default();
            if state.total_buckets == 0 {
                state.next_channel = segment as usize % channels;
            }
            state.total_buckets += 1;
        }

        // Buckets whose rays all retired on some TM.
        while let Some(segment) = self.scheduler.bucket_complete_queue.pop_front() {
            let state = self
                .scheduler
                .segment_state_map
                .get_mut(&segment)
                .expect("complete for a dead segment");
            state.retired_buckets += 1;
        }

        // Prefetch completions from the scene buffer.
        if let Some(scene_buffer) = &self.scene_buffer {
            let mut sb = scene_buffer.borrow_mut();
            if sb.prefetch_complete_sideband.is_read_valid() {
                let segment = sb.prefetch_complete_sideband.read();
                drop(sb);
                if let Some(state) = self.scheduler.segment_state_map.get_mut(&segment) {
                    state.prefetch_complete = true;
                }
                self.scheduler.concurrent_prefetches -= 1;
            }
        }

        // Prefetch the next candidate with parked rays.
        for i in 0..self.scheduler.candidate_segments.len() {
            let candidate = self.scheduler.candidate_segments[i];
            let state = &self.scheduler.segment_state_map[&candidate];
            if !state.prefetch_issued
                && state.total_buckets > 0
                && self.scheduler.active_segments < self.max_active_segments
                && self.scheduler.concurrent_prefetches < MAX_CONCURRENT_PREFETCHES
            {
                self.scheduler
                    .segment_state_map
                    .get_mut(&candidate)
                    .expect("candidate has state")
                    .prefetch_issued = true;
                self.scheduler.active_segments += 1;
                self.issue_prefetch(candidate);
                debug!(segment = candidate, "segment prefetch issued");
                break;
            }
        }

        // Retire a finished candidate.
        for i in 0..self.scheduler.candidate_segments.len() {
            let candidate = self.scheduler.candidate_segments[i];
            let state = &self.scheduler.segment_state_map[&candidate];
            if state.parent_finished
                && state.child_order_generated
                && state.retired_buckets == state.total_buckets
            {
                let was_prefetched = state.prefetch_issued;
                let total_buckets = state.total_buckets;
                let _ = self.scheduler.candidate_segments.remove(i);

                let header = self.header(candidate);
                for child in header.first_child..header.first_child + header.num_children {
                    self.scheduler
                        .segment_state_map
                        .entry(child)
                        .or_default()
                        .parent_finished = true;
                    let child_bank = child as usize % self.banks.len();
                    self.banks[child_bank].bucket_flush_queue.push_back(child);
                }

                if was_prefetched {
                    if self.scene_buffer.is_some() {
                        self.scheduler.scene_retire_queue.push_back(candidate);
                    }
                    self.scheduler.active_segments -= 1;
                    if total_buckets == 1 {
                        self.log.single_bucket_segments += 1;
                    }
                    debug!(segment = candidate, buckets = total_buckets, "segment retired");
                } else {
                    debug!(segment = candidate, "segment culled");
                }

                let _ = self.scheduler.segment_state_map.remove(&candidate);
                break;
            }
        }

        let buckets_ready: usize = self
            .scheduler
            .candidate_segments
            .iter()
            .map(|s| self.scheduler.segment_state_map[s].bucket_address_queue.len())
            .sum();

        // Expand the candidate set when ready work runs low.
        if buckets_ready < BUCKETS_READY_LOW_WATER
            && self.scheduler.root_rays_counter == self.config_num_root_rays
            && self.scheduler.candidate_segments.len() < self.max_active_segments
        {
            match self.traversal_scheme {
                TraversalScheme::Bfs => self.expand_bfs(),
                TraversalScheme::Dfs => self.expand_dfs(),
            }
        }

        self.schedule_bucket_read();
        self.schedule_bucket_write();
    }

    fn expand_bfs(&mut self) {
        let last = self.scheduler.last_segment_activated;
        let last_state = self
            .scheduler
            .segment_state_map
            .get(&last)
            .map(|s| (s.child_order_generated, s.parent_finished, s.total_buckets, s.depth));
        if let Some((generated, parent_finished, total_buckets, depth)) = last_state {
            if !generated {
                // A segment that finished without ever holding a bucket has
                // no live rays; its subtree is culled.
                if !parent_finished || total_buckets > 0 {
                    let header = self.header(last);
                    for child in header.first_child..header.first_child + header.num_children {
                        let child_state = self.scheduler.segment_state_map.entry(child).or_default();
                        child_state.depth = depth + 1;
                        self.scheduler.traversal_queue.push_back(child);
                    }
                }
                self.scheduler
                    .segment_state_map
                    .get_mut(&last)
                    .expect("probed above")
                    .child_order_generated = true;
            }
        }

        if let Some(next) = self.scheduler.traversal_queue.pop_front() {
            self.scheduler.candidate_segments.push(next);
            self.scheduler.last_segment_activated = next;
            trace!(segment = next, "segment scheduled");
        }
    }

    fn expand_dfs(&mut self) {
        let last = self.scheduler.last_segment_activated;
        let last_state = self
            .scheduler
            .segment_state_map
            .get(&last)
            .map(|s| (s.child_order_generated, s.depth));
        if let Some((false, depth)) = last_state {
            let header = self.header(last);
            let mut weighted: Vec<(u64, u32)> = (0..header.num_children)
                .map(|i| {
                    let child = header.first_child + i;
                    let child_state = self.scheduler.segment_state_map.entry(child).or_default();
                    child_state.depth = depth + 1;
                    let weight = match self.weight_scheme {
                        WeightScheme::TotalWeight => child_state.weight,
                        WeightScheme::AverageRayWeight => {
                            child_state.weight / child_state.num_rays.max(1)
                        }
                        WeightScheme::MemoryOrder => 0,
                    };
                    child_state.scheduled_weight = weight;
                    (weight, child)
                })
                .collect();

            // Ascending weight: the heaviest child ends up on top of the
            // stack and is expanded first.
            weighted.sort_by_key(|&(weight, _)| weight);
            for (_, child) in weighted {
                self.scheduler.traversal_stack.push(child);
            }

            self.scheduler
                .segment_state_map
                .get_mut(&last)
                .expect("probed above")
                .child_order_generated = true;
        }

        if let Some(next) = self.scheduler.traversal_stack.pop() {
            self.scheduler.candidate_segments.push(next);
            self.scheduler.last_segment_activated = next;
            let weight = self.scheduler.segment_state_map[&next].scheduled_weight;
            trace!(segment = next, weight, "segment scheduled");
        }
    }

    /// Hands the oldest bucket of the best ready segment to the TM at the
    /// head of the request queue.
    fn schedule_bucket_read(&mut self) {
        let Some(&tm_index) = self.scheduler.bucket_request_queue.front() else {
            return;
        };
        let last_segment = self.scheduler.last_segment_on_tm[tm_index as usize];

        let mut current = None;
        for &candidate in &self.scheduler.candidate_segments {
            let state = &self.scheduler.segment_state_map[&candidate];
            // Only prefetched segments may issue; prefer keeping a TM on
            // the segment it already has resident state for.
            if state.prefetch_complete
                && !state.bucket_address_queue.is_empty()
                && (current.is_none() || candidate == last_segment)
            {
                current = Some(candidate);
            }
        }
        let Some(segment) = current else {
            return;
        };

        let _ = self.scheduler.bucket_request_queue.pop_front();
        self.scheduler.last_segment_on_tm[tm_index as usize] = segment;

        let state = self
            .scheduler
            .segment_state_map
            .get_mut(&segment)
            .expect("candidate has state");
        let addr = state
            .bucket_address_queue
            .pop_front()
            .expect("nonempty checked");

        let channel_index = self.scheduler.memory_managers[0].channel_of(addr);
        self.scheduler.memory_managers[channel_index].free_bucket(addr);
        self.channels[channel_index]
            .work_queue
            .push_back(ChannelWork::ReadBucket {
                addr,
                dst_tm: tm_index,
            });
        self.log.buckets_launched += 1;
    }

    /// Assigns a freshly coalesced bucket an address and queues its write.
    fn schedule_bucket_write(&mut self) {
        self.scheduler.bucket_write_cascade.clock();
        if !self.scheduler.bucket_write_cascade.is_read_valid(0) {
            return;
        }
        let bucket = self.scheduler.bucket_write_cascade.read(0);
        assert!(!bucket.is_empty(), "empty bucket reached the write path");
        let segment = bucket.segment;
        let state = self
            .scheduler
            .segment_state_map
            .get_mut(&segment)
            .expect("bucket for a dead segment");

        let channel_index = state.next_channel;
        let addr = self.scheduler.memory_managers[channel_index].alloc_bucket();
        state.bucket_address_queue.push_back(addr);
        state.next_channel = (state.next_channel + 1) % self.channels.len();

        self.channels[channel_index]
            .work_queue
            .push_back(ChannelWork::WriteBucket {
                addr,
                image: Box::new(bucket.to_bytes()),
            });
        self.log.buckets_generated += 1;
    }

    /// Streams the next block-sized sub-request of the channel's current
    /// work item into DRAM.
    fn issue_request(&mut self, channel_index: usize) {
        let port = self.dram_port(channel_index);
        if !self.main_mem.borrow().request_port_write_valid(port) {
            return;
        }
        let block_size = self.block_size;
        let channel = &mut self.channels[channel_index];
        let Some(work) = channel.work_queue.front() else {
            return;
        };

        let request = match work {
            ChannelWork::ReadBucket { addr, dst_tm } => {
                let mut req =
                    MemoryRequest::load(addr + channel.bytes_requested, block_size as usize, port as u16);
                req.dst = crate::common::bits::BitStack58::tag(u64::from(*dst_tm));
                req
            }
            ChannelWork::WriteBucket { addr, image } => {
                let at = channel.bytes_requested as usize;
                MemoryRequest::store(
                    addr + channel.bytes_requested,
                    &image[at..at + block_size as usize],
                    port as u16,
                )
            }
        };
        self.main_mem.borrow_mut().write_request(request);

        channel.bytes_requested += block_size;
        if channel.bytes_requested >= BUCKET_BYTES as u64 {
            channel.bytes_requested = 0;
            let _ = channel.work_queue.pop_front();
        }
    }

    /// Forwards one DRAM return (a bucket block) to its destination TM.
    fn issue_return(&mut self, channel_index: usize) {
        if !self.return_network.is_write_valid(channel_index) {
            return;
        }
        let Some(mut ret) = self.channels[channel_index].forward_return.take() else {
            return;
        };
        let dst_tm = ret.dst.tag_value();
        if (dst_tm as usize) < self.return_network_sinks() {
            ret.port = dst_tm as u16;
            self.return_network.write(ret, channel_index);
        }
    }

    fn return_network_sinks(&self) -> usize {
        self.scheduler.last_segment_on_tm.len()
    }
}

impl Unit for UnitStreamScheduler {
    fn clock_rise(&mut self) {
        let num_banks = self.banks.len();
        let num_tms = self.scheduler.last_segment_on_tm.len();
        self.request_network.clock(move |req: &StreamRequest| {
            // Segment zero is stored by every TM at once; spread it over
            // the banks by source instead of hashing.
            match *req {
                StreamRequest::StoreWorkItem { item, .. } if item.segment != 0 => {
                    item.segment as usize % num_banks
                }
                _ => req.port() as usize * num_banks / num_tms,
            }
        });

        for bank_index in 0..self.banks.len() {
            self.process_request(bank_index);
        }
        for channel_index in 0..self.channels.len() {
            self.process_return(channel_index);
        }

        self.update_scheduler();
    }

    fn clock_fall(&mut self) {
        for channel_index in 0..self.channels.len() {
            // Once the candidate set drains, bucket requests answer with a
            // size-0 return so the cores can retire their slots.
            if self.is_complete()
                && self.return_network.is_write_valid(channel_index)
                && !self.scheduler.bucket_request_queue.is_empty()
            {
                let tm_index = self
                    .scheduler
                    .bucket_request_queue
                    .pop_front()
                    .expect("checked above");
                let ret = MemoryReturn::empty(tm_index);
                self.return_network.write(ret, channel_index);
                continue;
            }

            self.issue_request(channel_index);
            self.issue_return(channel_index);
        }

        if let Some(scene_buffer) = &self.scene_buffer {
            let mut sb = scene_buffer.borrow_mut();
            if !self.scheduler.scene_prefetch_queue.is_empty() && sb.prefetch_sideband.is_write_valid() {
                let order = self
                    .scheduler
                    .scene_prefetch_queue
                    .pop_front()
                    .expect("checked above");
                sb.prefetch_sideband.write(order);
            }
            if !self.scheduler.scene_retire_queue.is_empty() && sb.retire_sideband.is_write_valid() {
                let segment = self
                    .scheduler
                    .scene_retire_queue
                    .pop_front()
                    .expect("checked above");
                sb.retire_sideband.write(segment);
            }
        }

        if let Some((l2, l2_port)) = &self.l2_cache {
            if !self.scheduler.l2_prefetch_queue.is_empty()
                && l2.borrow().request_port_write_valid(*l2_port)
            {
                let addr = self
                    .scheduler
                    .l2_prefetch_queue
                    .pop_front()
                    .expect("checked above");
                let req = MemoryRequest::prefetch(addr, self.block_size as usize, *l2_port as u16);
                l2.borrow_mut().write_request(req);
            }
        }

        if self.is_complete() && !self.complete_reported {
            self.complete_reported = true;
            self.tracker.decr();
        }

        self.return_network.clock();
    }

    fn reset(&mut self) {
        self.log.reset();
    }
}
