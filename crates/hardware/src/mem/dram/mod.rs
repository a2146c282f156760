//! Address-mapped DRAM channel model.
//!
//! The unit owns the backing storage, one [`DramChannel`] per configured
//! channel, and the request/return crossbars. Requests route to channels by
//! the address decode; inside a channel the command scheduler models
//! activate/read/write/precharge timing, refresh windows, and power states
//! (`channel`). The DRAM clock runs at an integer multiple of the
//! simulator clock; completed reads surface through a per-channel min-heap
//! keyed by simulator cycle.
//!
//! Functional behavior: stores are applied to the backing store at queue
//! insertion; a read captures its data at insertion too, so a younger
//! queued write to the same block is already visible, matching the
//! look-aside forwarding the timing model charges for.

/// Per-channel command scheduling and bank state machines.
pub mod channel;
/// Geometry and timing tables.
pub mod config;
/// Address decode.
pub mod decode;

pub use channel::{BankPhase, BankState};
pub use config::{AddressMapping, DramConfig, DramTiming};
pub use decode::{channel_of, decode, encode, DramAddress};

use serde::Serialize;

use self::channel::{ChannelEvents, DramChannel, QueuedRead, QueuedWrite};
use crate::common::track::WorkTracker;
use crate::common::{Cycles, Paddr};
use crate::mem::ports::{MemUnit, ReturnXbar};
use crate::mem::transaction::{MemOp, MemoryRequest, MemoryReturn};
use crate::net::CascadedCrossbar;
use crate::sim::Unit;

/// Traffic and command counters for the DRAM unit.
#[derive(Clone, Copy, Default, Serialize)]
pub struct DramLog {
    /// Read transactions accepted.
    pub loads: u64,
    /// Write transactions accepted.
    pub stores: u64,
    /// Bytes delivered to clients.
    pub bytes_read: u64,
    /// Bytes absorbed from clients.
    pub bytes_written: u64,
    /// Reads answered from a queued read to the same block.
    pub read_merges: u64,
    /// Reads answered from a queued write to the same block.
    pub write_forwards: u64,
    /// Writes absorbed by an already queued write to the same block.
    pub write_merges: u64,
    /// Activate commands issued.
    pub activates: u64,
    /// Column commands that hit an open row.
    pub row_hits: u64,
    /// Precharge commands issued.
    pub precharges: u64,
    /// Auto-refresh commands issued.
    pub refreshes: u64,
    /// Rank power-down entries.
    pub powerdowns: u64,
}

impl DramLog {
    /// Clears every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Adds `other` into this log.
    pub fn accumulate(&mut self, other: &Self) {
        self.loads += other.loads;
        self.stores += other.stores;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.read_merges += other.read_merges;
        self.write_forwards += other.write_forwards;
        self.write_merges += other.write_merges;
        self.activates += other.activates;
        self.row_hits += other.row_hits;
        self.precharges += other.precharges;
        self.refreshes += other.refreshes;
        self.powerdowns += other.powerdowns;
    }

    /// Row-buffer hit rate over all column commands.
    pub fn row_hit_rate(&self) -> f64 {
        let col = self.row_hits;
        if col == 0 {
            return 0.0;
        }
        (col.saturating_sub(self.activates)) as f64 / col as f64
    }
}

/// The DRAM unit: backing storage plus one scheduler per channel.
pub struct UnitDram {
    config: DramConfig,
    data: Vec<u8>,
    channels: Vec<DramChannel>,
    request_network: CascadedCrossbar<MemoryRequest>,
    return_network: ReturnXbar,

    returns: Vec<MemoryReturn>,
    free_return_ids: Vec<u32>,

    dram_cycle: u64,
    sim_cycle: Cycles,
    busy: bool,
    tracker: WorkTracker,

    /// Traffic and command counters.
    pub log: DramLog,
}

impl UnitDram {
    /// Creates the unit with `num_ports` client ports.
    pub fn new(num_ports: usize, config: DramConfig, tracker: WorkTracker) -> Self {
        config.validate().expect("invalid DRAM configuration");
        let channels = (0..config.num_channels).map(|_| DramChannel::new(&config)).collect();
        Self {
            data: vec![0; config.size as usize],
            channels,
            request_network: CascadedCrossbar::new(num_ports, config.num_channels as usize, 64, 64),
            return_network: ReturnXbar::new(config.num_channels as usize, num_ports, 64),
            returns: Vec::new(),
            free_return_ids: Vec::new(),
            dram_cycle: 0,
            sim_cycle: 0,
            busy: false,
            tracker,
            config,
            log: DramLog::default(),
        }
    }

    /// Returns the configuration the unit was built with.
    pub fn config(&self) -> &DramConfig {
        &self.config
    }

    /// Writes `bytes` directly into the backing store, bypassing timing.
    pub fn direct_write(&mut self, bytes: &[u8], addr: Paddr) {
        let at = addr as usize;
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads the backing store directly, bypassing timing.
    pub fn direct_read(&self, addr: Paddr, len: usize) -> &[u8] {
        let at = addr as usize;
        &self.data[at..at + len]
    }

    fn alloc_return(&mut self, ret: MemoryReturn) -> u32 {
        if let Some(id) = self.free_return_ids.pop() {
            self.returns[id as usize] = ret;
            id
        } else {
            self.returns.push(ret);
            (self.returns.len() - 1) as u32
        }
    }

    /// Queues a read, merging with an in-flight access to the same block
    /// where possible. Returns `false` on a full read queue.
    fn insert_read(&mut self, request: &MemoryRequest, channel_index: usize) -> bool {
        let line = request.paddr & !(self.config.block_size - 1);
        let at = request.paddr as usize;
        let ret = MemoryReturn::from_request(request, &self.data[at..at + request.size as usize]);

        // Look-aside: a queued write to the block answers the read without
        // touching the array.
        if self.channels[channel_index].matching_write(line) {
            let id = self.alloc_return(ret);
            let done = (self.dram_cycle + self.config.lookaside_latency) / self.config.clock_multiplier;
            self.channels[channel_index]
                .completions
                .push(std::cmp::Reverse((done.max(self.sim_cycle + 1), id)));
            self.log.write_forwards += 1;
            self.log.loads += 1;
            return true;
        }

        // Coalesce with a queued read of the same block.
        if let Some(read) = self.channels[channel_index].matching_read(line) {
            let id = if let Some(free) = self.free_return_ids.pop() {
                self.returns[free as usize] = ret;
                free
            } else {
                self.returns.push(ret);
                (self.returns.len() - 1) as u32
            };
            read.return_ids.push(id);
            self.log.read_merges += 1;
            self.log.loads += 1;
            return true;
        }

        if self.channels[channel_index].read_queue.len() >= self.config.read_queue_depth {
            return false;
        }

        let id = self.alloc_return(ret);
        let addr = decode(&self.config, line);
        self.channels[channel_index].read_queue.push(QueuedRead {
            paddr: line,
            addr,
            arrival: self.dram_cycle,
            return_ids: vec![id],
        });
        self.log.loads += 1;
        true
    }

    /// Queues a write; the data lands in the backing store immediately.
    /// Returns `false` on a full write queue.
    fn insert_write(&mut self, request: &MemoryRequest, channel_index: usize) -> bool {
        let line = request.paddr & !(self.config.block_size - 1);
        let merged = self.channels[channel_index].matching_write(line);
        if !merged && self.channels[channel_index].write_queue.len() >= self.config.write_queue_depth {
            return false;
        }

        let at = request.paddr as usize;
        self.data[at..at + request.size as usize].copy_from_slice(request.payload());
        self.log.stores += 1;
        self.log.bytes_written += u64::from(request.size);

        if merged {
            self.log.write_merges += 1;
            return true;
        }

        let addr = decode(&self.config, line);
        self.channels[channel_index].write_queue.push(QueuedWrite {
            paddr: line,
            addr,
            arrival: self.dram_cycle,
        });
        true
    }
}

impl Unit for UnitDram {
    fn clock_rise(&mut self) {
        let cfg = self.config.clone();
        self.request_network
            .clock(move |req: &MemoryRequest| channel_of(&cfg, req.paddr) as usize);

        for channel_index in 0..self.channels.len() {
            if !self.request_network.is_read_valid(channel_index) {
                continue;
            }
            let accepted = {
                let request = *self.request_network.peek(channel_index);
                match request.op {
                    MemOp::Load => self.insert_read(&request, channel_index),
                    MemOp::Store => self.insert_write(&request, channel_index),
                    other => panic!("DRAM cannot service {other:?}"),
                }
            };
            if accepted {
                let _ = self.request_network.read(channel_index);
                if !self.busy {
                    self.busy = true;
                    self.tracker.incr();
                }
            }
        }
    }

    fn clock_fall(&mut self) {
        let mut events = ChannelEvents::default();
        for _ in 0..self.config.clock_multiplier {
            for channel in &mut self.channels {
                channel.tick(self.dram_cycle, &self.config, &mut events);
            }
            self.dram_cycle += 1;
        }
        self.log.activates += events.activates;
        self.log.row_hits += events.row_hits;
        self.log.precharges += events.precharges;
        self.log.refreshes += events.refreshes;
        self.log.powerdowns += events.powerdowns;

        self.sim_cycle += 1;
        for channel_index in 0..self.channels.len() {
            let ready = match self.channels[channel_index].completions.peek() {
                Some(std::cmp::Reverse((cycle, _))) => *cycle <= self.sim_cycle,
                None => false,
            };
            if ready && self.return_network.is_write_valid(channel_index) {
                let std::cmp::Reverse((_, id)) = self.channels[channel_index]
                    .completions
                    .pop()
                    .expect("peeked above");
                let ret = self.returns[id as usize];
                self.log.bytes_read += u64::from(ret.size);
                self.return_network.write(ret, channel_index);
                self.free_return_ids.push(id);
            }
        }

        if self.busy && self.channels.iter().all(DramChannel::is_idle) {
            self.busy = false;
            self.tracker.decr();
        }

        self.return_network.clock();
    }

    fn reset(&mut self) {
        self.log.reset();
    }
}

impl MemUnit for UnitDram {
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
