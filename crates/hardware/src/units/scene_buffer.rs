//! On-chip treelet store.
//!
//! A directly-mapped buffer sized for K treelets, presented through the
//! standard memory-port contract. The stream scheduler drives it through
//! three side-band FIFOs: prefetch orders (segment plus a ray-count ratio),
//! retire orders, and prefetch-complete notifications flowing back.
//!
//! Internally a slot table maps segment id to buffer slot; per-channel
//! prefetch queues stream row-sized spans from DRAM. In dynamic-prefetch
//! mode only the leading blocks arrive eagerly and a block-validity bitmap
//! tracks the rest: a read that misses the bitmap triggers on-demand
//! completion, and a read racing an in-flight block is a half-miss that
//! waits without re-requesting. Retire frees the slot and clears its
//! bitmap. Addressing a segment that is not resident is fatal.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use tracing::trace;

use crate::common::bits::pext;
use crate::common::Paddr;
use crate::mem::ports::{MemHandle, MemUnit, ReturnXbar};
use crate::mem::transaction::{MemoryRequest, MemoryReturn};
use crate::net::{CascadedCrossbar, Fifo, Pipeline};
use crate::sim::Unit;

/// Scene buffer configuration.
pub struct SceneBufferConfig {
    /// Total buffer bytes; a multiple of `treelet_bytes`.
    pub size: u64,
    /// Client ports.
    pub num_ports: usize,
    /// Banks.
    pub num_banks: usize,
    /// Bank-select mask applied to translated buffer addresses.
    pub bank_select_mask: u64,
    /// Fixed byte budget of one treelet.
    pub treelet_bytes: u64,
    /// Base address of the treelet array in DRAM.
    pub segment_start: Paddr,
    /// DRAM channels prefetches stripe over.
    pub num_channels: usize,
    /// DRAM row bytes; the span granularity of eager prefetch.
    pub row_size: u64,
    /// Transfer block bytes.
    pub block_size: u64,
    /// Bank access latency in ticks.
    pub latency: u32,
    /// Fetch only the leading ray-ratio-scaled span eagerly; complete the
    /// rest on demand.
    pub dynamic_prefetch: bool,
    /// Blocks pulled per on-demand completion.
    pub prefetch_blocks: u64,
    /// Backing DRAM.
    pub main_mem: MemHandle,
    /// First DRAM port reserved for this unit.
    pub main_mem_port_offset: usize,
    /// Stride between this unit's per-channel DRAM ports.
    pub main_mem_port_stride: usize,
}

/// Maps segment ids to buffer slots and translates scene addresses.
struct AddressTranslator {
    segment_bytes: u64,
    start: Paddr,
    free_slots: BTreeSet<u32>,
    segment_map: BTreeMap<u32, u32>,
}

impl AddressTranslator {
    fn new(start: Paddr, segment_bytes: u64, slots: u32) -> Self {
        Self {
            segment_bytes,
            start,
            free_slots: (0..slots).collect(),
            segment_map: BTreeMap::new(),
        }
    }

    fn num_free_slots(&self) -> usize {
        self.free_slots.len()
    }

    fn is_mapped(&self, segment: u32) -> bool {
        self.segment_map.contains_key(&segment)
    }

    fn map(&mut self, segment: u32) -> u32 {
        let slot = *self.free_slots.iter().next().expect("mapped with no free slot");
        let _ = self.free_slots.remove(&slot);
        let _ = self.segment_map.insert(segment, slot);
        slot
    }

    fn unmap(&mut self, segment: u32) {
        let slot = self.slot(segment);
        let _ = self.free_slots.insert(slot);
        let _ = self.segment_map.remove(&segment);
    }

    fn slot(&self, segment: u32) -> u32 {
        *self
            .segment_map
            .get(&segment)
            .unwrap_or_else(|| panic!("segment {segment} is not resident in the scene buffer"))
    }

    fn segment_id(&self, paddr: Paddr) -> u32 {
        ((paddr - self.start) / self.segment_bytes) as u32
    }

    fn segment_address(&self, segment: u32) -> Paddr {
        self.start + u64::from(segment) * self.segment_bytes
    }

    fn translate(&self, paddr: Paddr) -> u64 {
        let segment = self.segment_id(paddr);
        let offset = paddr - self.segment_address(segment);
        u64::from(self.slot(segment)) * self.segment_bytes + offset
    }
}

struct Bank {
    data_pipeline: Pipeline<MemoryReturn>,
}

struct Channel {
    /// Row-sized spans of an eager prefetch.
    prefetch_queue: VecDeque<Paddr>,
    /// (base, blocks) spans of dynamic and on-demand prefetch.
    dynamic_queue: VecDeque<(Paddr, u64)>,
    bytes_requested: u64,
}

const BLOCK_INVALID: u8 = 0;
const BLOCK_INFLIGHT: u8 = 1;
const BLOCK_VALID: u8 = 2;

/// Traffic counters for the scene buffer.
#[derive(Clone, Copy, Default, Serialize)]
pub struct SceneBufferLog {
    /// Reads serviced from the array.
    pub loads: u64,
    /// Reads that missed the validity bitmap and triggered on-demand
    /// completion.
    pub read_misses: u64,
    /// Fill blocks written into the array.
    pub fills: u64,
    /// Bytes returned to clients.
    pub bytes_read: u64,
    /// Bytes filled from DRAM.
    pub bytes_written: u64,
}

impl SceneBufferLog {
    /// Clears every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Adds `other` into this log.
    pub fn accumulate(&mut self, other: &Self) {
        self.loads += other.loads;
        self.read_misses += other.read_misses;
        self.fills += other.fills;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }
}

/// The on-chip treelet store.
pub struct UnitSceneBuffer {
    /// Prefetch orders from the stream scheduler: (segment, ray ratio).
    pub prefetch_sideband: Fifo<(u32, f32)>,
    /// Retire orders from the stream scheduler.
    pub retire_sideband: Fifo<u32>,
    /// Prefetch-complete notifications to the stream scheduler.
    pub prefetch_complete_sideband: Fifo<u32>,

    translator: AddressTranslator,
    data: Vec<u8>,
    block_status: Vec<u8>,
    banks: Vec<Bank>,
    channels: Vec<Channel>,
    segment_bytes_returned: BTreeMap<u32, u64>,
    prefetch_complete_queue: VecDeque<u32>,

    request_network: CascadedCrossbar<MemoryRequest>,
    return_network: ReturnXbar,

    bank_select_mask: u64,
    block_size: u64,
    row_size: u64,
    dynamic_prefetch: bool,
    prefetch_blocks: u64,

    main_mem: MemHandle,
    main_mem_port_offset: usize,
    main_mem_port_stride: usize,

    /// Traffic counters.
    pub log: SceneBufferLog,
}

impl UnitSceneBuffer {
    /// Creates the buffer from its configuration.
    pub fn new(config: SceneBufferConfig) -> Self {
        assert!(config.size % config.treelet_bytes == 0);
        let slots = (config.size / config.treelet_bytes) as u32;
        Self {
            prefetch_sideband: Fifo::new(16),
            retire_sideband: Fifo::new(16),
            prefetch_complete_sideband: Fifo::new(16),
            translator: AddressTranslator::new(config.segment_start, config.treelet_bytes, slots),
            data: vec![0; config.size as usize],
            block_status: vec![BLOCK_INVALID; (config.size / config.block_size) as usize],
            banks: (0..config.num_banks)
                .map(|_| Bank {
                    data_pipeline: Pipeline::new(config.latency),
                })
                .collect(),
            channels: (0..config.num_channels)
                .map(|_| Channel {
                    prefetch_queue: VecDeque::new(),
                    dynamic_queue: VecDeque::new(),
                    bytes_requested: 0,
                })
                .collect(),
            segment_bytes_returned: BTreeMap::new(),
            prefetch_complete_queue: VecDeque::new(),
            request_network: CascadedCrossbar::new(config.num_ports, config.num_banks, 64, 64),
            return_network: ReturnXbar::new(config.num_banks, config.num_ports, 64),
            bank_select_mask: config.bank_select_mask,
            block_size: config.block_size,
            row_size: config.row_size,
            dynamic_prefetch: config.dynamic_prefetch,
            prefetch_blocks: config.prefetch_blocks.max(1),
            main_mem: config.main_mem,
            main_mem_port_offset: config.main_mem_port_offset,
            main_mem_port_stride: config.main_mem_port_stride,
            log: SceneBufferLog::default(),
        }
    }

    fn dram_port(&self, channel: usize) -> usize {
        self.main_mem_port_offset + channel * self.main_mem_port_stride
    }

    fn channel_of(&self, paddr: Paddr) -> usize {
        ((paddr / self.row_size) % self.channels.len() as u64) as usize
    }

    fn process_retire(&mut self) {
        if !self.retire_sideband.is_read_valid() {
            return;
        }
        let segment = self.retire_sideband.read();
        if self.translator.is_mapped(segment) {
            let base = self.translator.translate(self.translator.segment_address(segment));
            let first_block = (base / self.block_size) as usize;
            let blocks = (self.translator.segment_bytes / self.block_size) as usize;
            for status in &mut self.block_status[first_block..first_block + blocks] {
                *status = BLOCK_INVALID;
            }
            self.translator.unmap(segment);
        }
        let _ = self.segment_bytes_returned.remove(&segment);
        trace!(segment, "scene buffer slot retired");
    }

    fn process_prefetch(&mut self) {
        if !self.prefetch_sideband.is_read_valid() || self.translator.num_free_slots() == 0 {
            return;
        }
        let (segment, ratio) = self.prefetch_sideband.read();
        let _ = self.translator.map(segment);
        let segment_addr = self.translator.segment_address(segment);
        let _ = self.segment_bytes_returned.insert(segment, 0);
        trace!(segment, ratio, "scene buffer prefetch");

        if self.dynamic_prefetch {
            // Pull only the leading ratio-scaled span; the rest completes
            // on demand as rays touch it.
            let bytes = (ratio.clamp(0.0, 1.0) * self.translator.segment_bytes as f32) as u64;
            let mut blocks = (bytes / self.block_size).max(1);
            let blocks_per_row = self.row_size / self.block_size;
            let mut addr = segment_addr;
            while blocks > 0 {
                let span = blocks.min(blocks_per_row);
                let channel = self.channel_of(addr);
                self.channels[channel].dynamic_queue.push_back((addr, span));
                blocks -= span;
                addr += span * self.block_size;
            }
            // Dispatch can begin immediately; missing blocks half-miss.
            self.prefetch_complete_queue.push_back(segment);
        } else {
            let mut offset = 0;
            while offset < self.translator.segment_bytes {
                let addr = segment_addr + offset;
                let channel = self.channel_of(addr);
                self.channels[channel].prefetch_queue.push_back(addr);
                offset += self.row_size;
            }
        }
    }

    fn process_requests(&mut self, bank_index: usize) {
        if !self.request_network.is_read_valid(bank_index) {
            return;
        }
        if self.dynamic_prefetch {
            let req = *self.request_network.peek(bank_index);
            let buffer_addr = self.translator.translate(req.paddr);
            let block = (buffer_addr / self.block_size) as usize;
            match self.block_status[block] {
                BLOCK_VALID => {
                    if !self.banks[bank_index].data_pipeline.is_write_valid() {
                        return;
                    }
                    let _ = self.request_network.read(bank_index);
                    let at = buffer_addr as usize;
                    let ret = MemoryReturn::from_request(&req, &self.data[at..at + req.size as usize]);
                    self.banks[bank_index].data_pipeline.write(ret);
                    self.log.loads += 1;
                }
                BLOCK_INFLIGHT => {
                    // Half miss: the fill is already on its way.
                }
                _ => {
                    self.log.read_misses += 1;
                    let block_base = req.paddr & !(self.block_size - 1);
                    let channel = self.channel_of(block_base);
                    let row_end = (block_base / self.row_size + 1) * self.row_size;
                    let blocks_to_row_end = (row_end - block_base) / self.block_size;
                    self.channels[channel]
                        .dynamic_queue
                        .push_back((block_base, self.prefetch_blocks.min(blocks_to_row_end.max(1))));
                    self.block_status[block] = BLOCK_INFLIGHT;
                }
            }
        } else if self.banks[bank_index].data_pipeline.is_write_valid() {
            let req = self.request_network.read(bank_index);
            let at = self.translator.translate(req.paddr) as usize;
            let ret = MemoryReturn::from_request(&req, &self.data[at..at + req.size as usize]);
            self.banks[bank_index].data_pipeline.write(ret);
            self.log.loads += 1;
        }
    }

    fn process_returns(&mut self, channel_index: usize) {
        let port = self.dram_port(channel_index);
        if !self.main_mem.borrow().return_port_read_valid(port) {
            return;
        }
        let ret = self.main_mem.borrow_mut().read_return(port);
        let segment = self.translator.segment_id(ret.paddr);
        // The segment can retire while its prefetch is in flight; stale
        // fills are discarded.
        if !self.translator.is_mapped(segment) {
            return;
        }
        let buffer_addr = self.translator.translate(ret.paddr);
        let at = buffer_addr as usize;
        self.data[at..at + ret.size as usize].copy_from_slice(ret.payload());
        self.block_status[(buffer_addr / self.block_size) as usize] = BLOCK_VALID;
        self.log.fills += 1;
        self.log.bytes_written += u64::from(ret.size);

        let returned = self.segment_bytes_returned.entry(segment).or_insert(0);
        *returned += u64::from(ret.size);
        if !self.dynamic_prefetch && *returned == self.translator.segment_bytes {
            self.prefetch_complete_queue.push_back(segment);
        }
    }

    fn issue_requests(&mut self, channel_index: usize) {
        let port = self.dram_port(channel_index);
        if !self.main_mem.borrow().request_port_write_valid(port) {
            return;
        }
        let block_size = self.block_size;
        let channel = &mut self.channels[channel_index];

        if let Some(&(base, blocks)) = channel.dynamic_queue.front() {
            let req = MemoryRequest::load(base + channel.bytes_requested, block_size as usize, port as u16);
            self.main_mem.borrow_mut().write_request(req);
            channel.bytes_requested += block_size;
            if channel.bytes_requested >= blocks * block_size {
                let _ = channel.dynamic_queue.pop_front();
                channel.bytes_requested = 0;
            }
            return;
        }

        if let Some(&base) = channel.prefetch_queue.front() {
            let req = MemoryRequest::load(base + channel.bytes_requested, block_size as usize, port as u16);
            self.main_mem.borrow_mut().write_request(req);
            channel.bytes_requested += block_size;
            if channel.bytes_requested >= self.row_size {
                let _ = channel.prefetch_queue.pop_front();
                channel.bytes_requested = 0;
            }
        }
    }

    fn issue_returns(&mut self, bank_index: usize) {
        if self.banks[bank_index].data_pipeline.is_read_valid()
            && self.return_network.is_write_valid(bank_index)
        {
            let ret = self.banks[bank_index].data_pipeline.read();
            self.log.bytes_read += u64::from(ret.size);
            self.return_network.write(ret, bank_index);
        }
    }
}

impl Unit for UnitSceneBuffer {
    fn clock_rise(&mut self) {
        let translator = &self.translator;
        let mask = self.bank_select_mask;
        let banks = self.banks.len() as u64;
        self.request_network
            .clock(|req: &MemoryRequest| (pext(translator.translate(req.paddr), mask) % banks) as usize);

        self.process_prefetch();
        self.process_retire();

        for bank_index in 0..self.banks.len() {
            self.process_requests(bank_index);
            self.banks[bank_index].data_pipeline.clock();
        }
        for channel_index in 0..self.channels.len() {
            self.process_returns(channel_index);
        }
    }

    fn clock_fall(&mut self) {
        for channel_index in 0..self.channels.len() {
            self.issue_requests(channel_index);
        }
        for bank_index in 0..self.banks.len() {
            self.issue_returns(bank_index);
        }

        if !self.prefetch_complete_queue.is_empty() && self.prefetch_complete_sideband.is_write_valid() {
            let segment = self.prefetch_complete_queue.pop_front().expect("checked above");
            self.prefetch_complete_sideband.write(segment);
        }

        self.return_network.clock();
    }

    fn reset(&mut self) {
        self.log.reset();
    }
}

impl MemUnit for UnitSceneBuffer {
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
