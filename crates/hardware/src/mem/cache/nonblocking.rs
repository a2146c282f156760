//! Non-blocking banked cache with per-bank MSHR files.
//!
//! A request that hits completes after the configured latency. A request
//! that misses allocates (or merges into) a miss-status holding register
//! keyed on its line address; the bank keeps accepting requests while up to
//! `num_mshr` line fetches are in flight. A miss that finds every MSHR busy
//! is left in the input network, which is back-pressure, not an error.
//!
//! On fill the victim way is selected, a dirty victim is queued for
//! write-back, store waiters are applied to the installed line, and load
//! waiters drain one per tick through the bank's hit pipeline. The MSHR
//! retires in the same tick the line is installed, keeping a line address
//! in at most one of the tag array and the MSHR file.

use std::collections::VecDeque;

use tracing::trace;

use super::{CacheConfig, CacheLog, Line, LineAddressing};
use crate::common::bits::BitStack58;
use crate::common::Paddr;
use crate::mem::ports::{MemHandle, MemUnit, ReturnXbar};
use crate::mem::transaction::{MemOp, MemoryRequest, MemoryReturn, MAX_PAYLOAD};
use crate::net::{CascadedCrossbar, Pipeline};
use crate::sim::Unit;

struct Waiter {
    port: u16,
    dst: BitStack58,
    paddr: Paddr,
    size: u8,
}

struct Mshr {
    line_paddr: Paddr,
    issued: bool,
    load_waiters: VecDeque<Waiter>,
    store_waiters: VecDeque<(Paddr, u8, [u8; MAX_PAYLOAD])>,
}

struct DrainEntry {
    waiter: Waiter,
    line: [u8; MAX_PAYLOAD],
    line_paddr: Paddr,
}

struct Bank {
    mshrs: Vec<Option<Mshr>>,
    fetch_queue: VecDeque<Paddr>,
    writeback_queue: VecDeque<(Paddr, [u8; MAX_PAYLOAD])>,
    drain_queue: VecDeque<DrainEntry>,
    hit_pipeline: Pipeline<MemoryReturn>,
}

impl Bank {
    fn mshr_for(&mut self, line_paddr: Paddr) -> Option<&mut Mshr> {
        self.mshrs
            .iter_mut()
            .flatten()
            .find(|m| m.line_paddr == line_paddr)
    }

    fn free_slot(&self) -> Option<usize> {
        self.mshrs.iter().position(Option::is_none)
    }
}

/// Non-blocking set-associative cache unit.
pub struct UnitNonBlockingCache {
    addressing: LineAddressing,
    associativity: usize,
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

impl UnitNonBlockingCache {
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
            lines: vec![Line::default(); num_lines],
            data: vec![0; config.size as usize],
            lru_tick: 0,
            banks: (0..config.num_banks)
                .map(|_| Bank {
                    mshrs: (0..config.num_mshr).map(|_| None).collect(),
                    fetch_queue: VecDeque::new(),
                    writeback_queue: VecDeque::new(),
                    drain_queue: VecDeque::new(),
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

    fn probe(&mut self, paddr: Paddr) -> Option<usize> {
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

    fn line_bytes(&self, idx: usize) -> &[u8] {
        let block = self.addressing.block_size as usize;
        &self.data[idx * block..(idx + 1) * block]
    }

    fn line_bytes_mut(&mut self, idx: usize) -> &mut [u8] {
        let block = self.addressing.block_size as usize;
        &mut self.data[idx * block..(idx + 1) * block]
    }

    /// Installs `bytes` for `line_paddr`, returning the victim write-back
    /// if the evicted line was dirty. Double insertion is fatal.
    fn install(&mut self, line_paddr: Paddr, bytes: &[u8]) -> Option<(Paddr, [u8; MAX_PAYLOAD])> {
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
            buf[..self.addressing.block_size as usize].copy_from_slice(self.line_bytes(victim));
            writeback = Some((victim_paddr, buf));
        }

        self.lines[victim] = Line {
            tag,
            valid: true,
            dirty: false,
            lru: 0,
        };
        let block_size = self.addressing.block_size as usize;
        self.line_bytes_mut(victim)
            .copy_from_slice(&bytes[..block_size]);
        self.touch(victim);
        writeback
    }

    fn process_fill(&mut self, bank_index: usize) {
        let port = self.higher_port(bank_index);
        if !self.mem_higher.borrow().return_port_read_valid(port) {
            return;
        }
        let ret = self.mem_higher.borrow_mut().read_return(port);
        let line_paddr = self.addressing.line_paddr(ret.paddr);

        let mshr = {
            let bank = &mut self.banks[bank_index];
            let slot = bank
                .mshrs
                .iter()
                .position(|m| m.as_ref().is_some_and(|m| m.line_paddr == line_paddr))
                .unwrap_or_else(|| panic!("fill for {line_paddr:#x} without an MSHR"));
            bank.mshrs[slot].take().expect("slot checked above")
        };

        if let Some(wb) = self.install(line_paddr, ret.payload()) {
            self.banks[bank_index].writeback_queue.push_back(wb);
            self.log.writebacks += 1;
        }

        // Apply store waiters in arrival order, then hand load waiters to
        // the drain queue with a snapshot of the line.
        let idx = self.probe(line_paddr).expect("line installed above");
        for (paddr, size, data) in mshr.store_waiters {
            let offset = (paddr - line_paddr) as usize;
            self.line_bytes_mut(idx)[offset..offset + size as usize]
                .copy_from_slice(&data[..size as usize]);
            self.lines[idx].dirty = true;
            self.log.bytes_written += u64::from(size);
        }
        let mut line = [0u8; MAX_PAYLOAD];
        line[..self.addressing.block_size as usize].copy_from_slice(self.line_bytes(idx));
        for waiter in mshr.load_waiters {
            self.banks[bank_index].drain_queue.push_back(DrainEntry {
                waiter,
                line,
                line_paddr,
            });
        }
    }

    fn process_request(&mut self, bank_index: usize) {
        // Drained fill waiters share the hit pipeline, one per tick, and
        // take priority over new requests.
        if let Some(entry) = self.banks[bank_index].drain_queue.front() {
            if self.banks[bank_index].hit_pipeline.is_write_valid() {
                let offset = (entry.waiter.paddr - entry.line_paddr) as usize;
                let size = entry.waiter.size;
                let mut ret = MemoryReturn::empty(entry.waiter.port);
                ret.size = size;
                ret.dst = entry.waiter.dst;
                ret.paddr = entry.waiter.paddr;
                ret.data[..size as usize].copy_from_slice(&entry.line[offset..offset + size as usize]);
                self.log.bytes_read += u64::from(size);
                self.banks[bank_index].hit_pipeline.write(ret);
                self.banks[bank_index].drain_queue.pop_front();
            }
            return;
        }

        if !self.request_network.is_read_valid(bank_index) {
            return;
        }

        let req = *self.request_network.peek(bank_index);
        assert!(!req.op.is_amo(), "atomics are serviced by the atomic regfile");
        let line_paddr = self.addressing.line_paddr(req.paddr);

        if let Some(idx) = self.probe(req.paddr) {
            match req.op {
                MemOp::Load => {
                    if !self.banks[bank_index].hit_pipeline.is_write_valid() {
                        return;
                    }
                    let offset = (req.paddr - line_paddr) as usize;
                    let line = self.line_bytes(idx);
                    let bytes = &line[offset..offset + req.size as usize];
                    let ret = MemoryReturn::from_request(&req, bytes);
                    self.touch(idx);
                    self.log.hits += 1;
                    self.log.bytes_read += u64::from(req.size);
                    self.banks[bank_index].hit_pipeline.write(ret);
                }
                MemOp::Store => {
                    let offset = (req.paddr - line_paddr) as usize;
                    self.line_bytes_mut(idx)[offset..offset + req.size as usize]
                        .copy_from_slice(req.payload());
                    self.lines[idx].dirty = true;
                    self.touch(idx);
                    self.log.hits += 1;
                    self.log.bytes_written += u64::from(req.size);
                }
                MemOp::Prefetch => {
                    self.touch(idx);
                    self.log.hits += 1;
                }
                _ => unreachable!(),
            }
            let _ = self.request_network.read(bank_index);
            return;
        }

        // Miss path: merge or allocate.
        let bank = &mut self.banks[bank_index];
        if let Some(mshr) = bank.mshr_for(line_paddr) {
            match req.op {
                MemOp::Load => mshr.load_waiters.push_back(Waiter {
                    port: req.port,
                    dst: req.dst,
                    paddr: req.paddr,
                    size: req.size,
                }),
                MemOp::Store => mshr.store_waiters.push_back((req.paddr, req.size, req.data)),
                MemOp::Prefetch => {}
                _ => unreachable!(),
            }
            self.log.half_misses += 1;
            let _ = self.request_network.read(bank_index);
            return;
        }

        let Some(slot) = bank.free_slot() else {
            // All MSHRs busy: leave the request in the network.
            self.log.mshr_stalls += 1;
            return;
        };

        let mut mshr = Mshr {
            line_paddr,
            issued: false,
            load_waiters: VecDeque::new(),
            store_waiters: VecDeque::new(),
        };
        match req.op {
            MemOp::Load => mshr.load_waiters.push_back(Waiter {
                port: req.port,
                dst: req.dst,
                paddr: req.paddr,
                size: req.size,
            }),
            MemOp::Store => mshr.store_waiters.push_back((req.paddr, req.size, req.data)),
            MemOp::Prefetch => {}
            _ => unreachable!(),
        }
        bank.mshrs[slot] = Some(mshr);
        bank.fetch_queue.push_back(line_paddr);
        trace!(line = format_args!("{line_paddr:#x}"), bank = bank_index, "mshr allocated");
        self.log.misses += 1;
        let _ = self.request_network.read(bank_index);
    }

    fn issue_higher(&mut self, bank_index: usize) {
        let port = self.higher_port(bank_index);
        if !self.mem_higher.borrow().request_port_write_valid(port) {
            return;
        }

        // Write-backs drain ahead of fetches so a fill never observes its
        // own victim still pending.
        if let Some((paddr, data)) = self.banks[bank_index].writeback_queue.pop_front() {
            let req =
                MemoryRequest::store(paddr, &data[..self.addressing.block_size as usize], port as u16);
            self.mem_higher.borrow_mut().write_request(req);
            return;
        }

        let Some(line_paddr) = self.banks[bank_index].fetch_queue.pop_front() else {
            return;
        };
        let req = MemoryRequest::load(line_paddr, self.addressing.block_size as usize, port as u16);
        self.mem_higher.borrow_mut().write_request(req);
        if let Some(mshr) = self.banks[bank_index].mshr_for(line_paddr) {
            mshr.issued = true;
        }
    }
}

impl Unit for UnitNonBlockingCache {
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

impl MemUnit for UnitNonBlockingCache {
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
