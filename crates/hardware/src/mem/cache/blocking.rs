//! Blocking banked cache.
//!
//! The simplest timing-correct cache: each bank services one request at a
//! time. Hits complete after the configured latency; a miss forwards the
//! line fetch to the next level with the bank index pushed onto the
//! destination bit-stack, and the bank refuses further work until the fill
//! returns. Stores allocate on miss, matching the non-blocking flavor so a
//! hierarchy can mix the two without changing visible write behavior.

use std::collections::VecDeque;

use super::{CacheConfig, CacheLog, Line, LineAddressing};
use crate::common::bits::log2i;
use crate::common::Paddr;
use crate::mem::ports::{MemHandle, MemUnit, ReturnXbar};
use crate::mem::transaction::{MemOp, MemoryRequest, MemoryReturn, MAX_PAYLOAD};
use crate::net::{CascadedCrossbar, Pipeline};
use crate::sim::Unit;

struct Bank {
    /// Request stalled on an outstanding line fetch.
    pending_miss: Option<MemoryRequest>,
    fetch_issued: bool,
    writeback_queue: VecDeque<(Paddr, [u8; MAX_PAYLOAD])>,
    hit_pipeline: Pipeline<MemoryReturn>,
}

/// Blocking set-associative cache unit.
pub struct UnitBlockingCache {
    addressing: LineAddressing,
    associativity: usize,
    bank_bits: u32,
    lines: Vec<Line>,
    data: Vec<u8>,
    lru_tick: u64,

    banks: Vec<Bank>,
    request_network: CascadedCrossbar<MemoryRequest>,
    return_network: ReturnXbar,

    mem_higher: MemHandle,
    mem_higher_port_offset: usize,
    mem_higher_port_stride: usize,

    /// Hit/miss and traffic counters.
    pub log: CacheLog,
}

impl UnitBlockingCache {
    /// Creates the cache from its configuration.
    pub fn new(config: &CacheConfig) -> Self {
        assert!(
            config.block_size as usize <= MAX_PAYLOAD,
            "cache line exceeds the transaction payload"
        );
        let addressing = LineAddressing::new(config);
        let num_lines = (config.size / config.block_size) as usize;
        Self {
            addressing,
            associativity: config.associativity,
            bank_bits: log2i((config.num_banks as u64).next_power_of_two()).max(1),
            lines: vec![Line::default(); num_lines],
            data: vec![0; config.size as usize],
            lru_tick: 0,
            banks: (0..config.num_banks)
                .map(|_| Bank {
                    pending_miss: None,
                    fetch_issued: false,
                    writeback_queue: VecDeque::new(),
                    hit_pipeline: Pipeline::new(config.latency),
                })
                .collect(),
            request_network: CascadedCrossbar::new(
                config.num_ports,
                config.num_banks,
                config.crossbar_width,
                config.crossbar_width,
            ),
            return_network: ReturnXbar::new(config.num_banks, config.num_ports, config.crossbar_width),
            mem_higher: config.mem_higher.clone(),
            mem_higher_port_offset: config.mem_higher_port_offset,
            mem_higher_port_stride: config.mem_higher_port_stride,
            log: CacheLog::default(),
        }
    }

    fn higher_port(&self, bank: usize) -> usize {
        self.mem_higher_port_offset + bank * self.mem_higher_port_stride
    }

    fn probe(&self, paddr: Paddr) -> Option<usize> {
        let set = self.addressing.set(paddr);
        let tag = self.addressing.tag(paddr);
        let base = (set as usize) * self.associativity;
        (0..self.associativity)
            .map(|way| base + way)
            .find(|&idx| self.lines[idx].valid && self.lines[idx].tag == tag)
    }

    fn touch(&mut self, idx: usize) {
        self.lru_tick += 1;
        self.lines[idx].lru = self.lru_tick;
    }

    fn line_slice(&mut self, idx: usize) -> &mut [u8] {
        let block = self.addressing.block_size as usize;
        &mut self.data[idx * block..(idx + 1) * block]
    }

    fn install(&mut self, line_paddr: Paddr, bytes: &[u8]) -> (usize, Option<(Paddr, [u8; MAX_PAYLOAD])>) {
        assert!(
            self.probe(line_paddr).is_none(),
            "line {line_paddr:#x} inserted into the tag array twice"
        );
        let set = self.addressing.set(line_paddr);
        let tag = self.addressing.tag(line_paddr);
        let base = (set as usize) * self.associativity;
        let victim = (0..self.associativity)
            .map(|way| base + way)
            .min_by_key(|&idx| if self.lines[idx].valid { self.lines[idx].lru } else { 0 })
            .expect("associativity is nonzero");

        let mut writeback = None;
        if self.lines[victim].valid && self.lines[victim].dirty {
            let victim_paddr = (self.lines[victim].tag * self.addressing.num_sets
                + (victim / self.associativity) as u64)
                * self.addressing.block_size;
            let mut buf = [0u8; MAX_PAYLOAD];
            let block = self.addressing.block_size as usize;
            buf[..block].copy_from_slice(&self.data[victim * block..(victim + 1) * block]);
            writeback = Some((victim_paddr, buf));
        }

        self.lines[victim] = Line {
            tag,
            valid: true,
            dirty: false,
            lru: 0,
        };
        let block = self.addressing.block_size as usize;
        self.line_slice(victim).copy_from_slice(&bytes[..block]);
        self.touch(victim);
        (victim, writeback)
    }

    /// Services `req` against an installed line; the caller guarantees the
    /// line is present. Returns `false` when the hit pipeline is full.
    fn service(&mut self, bank_index: usize, req: &MemoryRequest, idx: usize) -> bool {
        let line_paddr = self.addressing.line_paddr(req.paddr);
        let offset = (req.paddr - line_paddr) as usize;
        match req.op {
            MemOp::Load => {
                if !self.banks[bank_index].hit_pipeline.is_write_valid() {
                    return false;
                }
                let block = self.addressing.block_size as usize;
                let line = &self.data[idx * block..(idx + 1) * block];
                let ret = MemoryReturn::from_request(req, &line[offset..offset + req.size as usize]);
                self.log.bytes_read += u64::from(req.size);
                self.banks[bank_index].hit_pipeline.write(ret);
            }
            MemOp::Store => {
                self.line_slice(idx)[offset..offset + req.size as usize].copy_from_slice(req.payload());
                self.lines[idx].dirty = true;
                self.log.bytes_written += u64::from(req.size);
            }
            MemOp::Prefetch => {}
            _ => panic!("atomics are serviced by the atomic regfile"),
        }
        self.touch(idx);
        true
    }

    fn process_fill(&mut self, bank_index: usize) {
        let port = self.higher_port(bank_index);
        if !self.mem_higher.borrow().return_port_read_valid(port) {
            return;
        }
        let Some(req) = self.banks[bank_index].pending_miss else {
            panic!("fill arrived at an idle blocking bank");
        };

        let mut ret = self.mem_higher.borrow_mut().read_return(port);
        let stamped_bank = ret.dst.pop(self.bank_bits) as usize;
        assert!(stamped_bank == bank_index, "fill retraced to the wrong bank");

        let line_paddr = self.addressing.line_paddr(ret.paddr);
        let (idx, wb) = self.install(line_paddr, ret.payload());
        if let Some(wb) = wb {
            self.banks[bank_index].writeback_queue.push_back(wb);
            self.log.writebacks += 1;
        }
        if self.service(bank_index, &req, idx) {
            self.banks[bank_index].pending_miss = None;
        }
        self.banks[bank_index].fetch_issued = false;
    }

    fn process_request(&mut self, bank_index: usize) {
        // A stalled request whose fill already landed retries as a plain
        // hit once the pipeline has room.
        if let Some(req) = self.banks[bank_index].pending_miss {
            if let Some(idx) = self.probe(req.paddr) {
                if self.service(bank_index, &req, idx) {
                    self.banks[bank_index].pending_miss = None;
                }
            }
            return;
        }
        if !self.request_network.is_read_valid(bank_index) {
            return;
        }

        let req = *self.request_network.peek(bank_index);
        if let Some(idx) = self.probe(req.paddr) {
            if self.service(bank_index, &req, idx) {
                self.log.hits += 1;
                let _ = self.request_network.read(bank_index);
            }
            return;
        }

        self.log.misses += 1;
        self.banks[bank_index].pending_miss = Some(req);
        self.banks[bank_index].fetch_issued = false;
        let _ = self.request_network.read(bank_index);
    }

    fn issue_higher(&mut self, bank_index: usize) {
        let port = self.higher_port(bank_index);
        if !self.mem_higher.borrow().request_port_write_valid(port) {
            return;
        }

        if let Some((paddr, data)) = self.banks[bank_index].writeback_queue.pop_front() {
            let req =
                MemoryRequest::store(paddr, &data[..self.addressing.block_size as usize], port as u16);
            self.mem_higher.borrow_mut().write_request(req);
            return;
        }

        if self.banks[bank_index].fetch_issued {
            return;
        }
        let Some(pending) = self.banks[bank_index].pending_miss else {
            return;
        };
        // A stalled retry after the fill has already installed the line
        // must not refetch.
        if self.probe(pending.paddr).is_some() {
            return;
        }

        let line_paddr = self.addressing.line_paddr(pending.paddr);
        let mut req = MemoryRequest::load(line_paddr, self.addressing.block_size as usize, port as u16);
        req.dst.push(bank_index as u64, self.bank_bits);
        self.mem_higher.borrow_mut().write_request(req);
        self.banks[bank_index].fetch_issued = true;
    }
}

impl Unit for UnitBlockingCache {
    fn clock_rise(&mut self) {
        let addressing = self.addressing;
        self.request_network
            .clock(move |req: &MemoryRequest| addressing.bank(req.paddr));
        for bank_index in 0..self.banks.len() {
            self.process_fill(bank_index);
            self.process_request(bank_index);
        }
    }

    fn clock_fall(&mut self) {
        for bank_index in 0..self.banks.len() {
            self.issue_higher(bank_index);

            self.banks[bank_index].hit_pipeline.clock();
            if self.banks[bank_index].hit_pipeline.is_read_valid()
                && self.return_network.is_write_valid(bank_index)
            {
                let ret = self.banks[bank_index].hit_pipeline.read();
                self.return_network.write(ret, bank_index);
            }
        }
        self.return_network.clock();
    }

    fn reset(&mut self) {
        self.log.reset();
    }
}

impl MemUnit for UnitBlockingCache {
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
