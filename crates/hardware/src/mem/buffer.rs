//! Banked on-chip scratch buffer.
//!
//! A small SRAM presented through the standard memory-port contract: a
//! request cascade feeds the banks, each bank runs its accesses through a
//! fixed-latency pipeline, loads produce returns and stores are absorbed.
//! Used for on-chip ray and hit staging storage.

use serde::Serialize;

use super::ports::{MemUnit, RequestCascade, ReturnCascade};
use super::transaction::{MemOp, MemoryRequest, MemoryReturn};
use crate::common::bits::{log2i, nbit_mask};
use crate::common::{Cycles, Paddr};
use crate::net::Pipeline;
use crate::sim::Unit;

/// Scratch buffer configuration.
#[derive(Clone, Debug)]
pub struct BufferConfig {
    /// Backing storage size in bytes (power of two).
    pub size: u64,
    /// Number of client ports.
    pub num_ports: usize,
    /// Number of banks.
    pub num_banks: usize,
    /// Access latency in ticks.
    pub latency: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: 1024,
            num_ports: 1,
            num_banks: 1,
            latency: 1,
        }
    }
}

struct Bank {
    data_pipeline: Pipeline<MemoryRequest>,
}

/// Traffic counters for a scratch buffer.
#[derive(Clone, Copy, Default, Serialize)]
pub struct BufferLog {
    /// Load transactions serviced.
    pub loads: u64,
    /// Store transactions absorbed.
    pub stores: u64,
    /// Bytes returned to clients.
    pub bytes_read: u64,
    /// Bytes written into the array.
    pub bytes_written: u64,
}

impl BufferLog {
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
    }

    /// Returns (read, write) bandwidth in bytes per tick over `cycles`.
    pub fn bandwidth(&self, cycles: Cycles) -> (f64, f64) {
        let c = cycles.max(1) as f64;
        (self.bytes_read as f64 / c, self.bytes_written as f64 / c)
    }
}

/// Banked scratch SRAM unit.
pub struct UnitBuffer {
    data: Vec<u8>,
    address_mask: u64,
    banks: Vec<Bank>,
    request_network: RequestCascade,
    return_network: ReturnCascade,
    /// Traffic counters.
    pub log: BufferLog,
}

impl UnitBuffer {
    /// Creates a buffer from its configuration.
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            data: vec![0; config.size as usize],
            address_mask: nbit_mask(log2i(config.size)),
            banks: (0..config.num_banks)
                .map(|_| Bank {
                    data_pipeline: Pipeline::new(config.latency),
                })
                .collect(),
            request_network: RequestCascade::new(config.num_ports, config.num_banks),
            return_network: ReturnCascade::new(config.num_banks, config.num_ports),
            log: BufferLog::default(),
        }
    }

    /// Writes `bytes` directly into the array, bypassing timing. Used to
    /// seed contents before a run.
    pub fn direct_write(&mut self, bytes: &[u8], addr: Paddr) {
        let at = self.buffer_addr(addr) as usize;
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads the array directly, bypassing timing.
    pub fn direct_read(&self, addr: Paddr, len: usize) -> &[u8] {
        let at = self.buffer_addr(addr) as usize;
        &self.data[at..at + len]
    }

    fn buffer_addr(&self, paddr: Paddr) -> Paddr {
        paddr & self.address_mask
    }
}

impl Unit for UnitBuffer {
    fn clock_rise(&mut self) {
        self.request_network.clock();

        for bank_index in 0..self.banks.len() {
            if !self.request_network.is_read_valid(bank_index)
                || !self.banks[bank_index].data_pipeline.is_write_valid()
            {
                continue;
            }
            let req = self.request_network.read(bank_index);
            self.banks[bank_index].data_pipeline.write(req);
        }
    }

    fn clock_fall(&mut self) {
        for bank_index in 0..self.banks.len() {
            self.banks[bank_index].data_pipeline.clock();

            if !self.banks[bank_index].data_pipeline.is_read_valid() {
                continue;
            }

            let op = self.banks[bank_index].data_pipeline.peek().op;
            match op {
                MemOp::Load => {
                    if !self.return_network.is_write_valid(bank_index) {
                        continue;
                    }
                    let req = self.banks[bank_index].data_pipeline.read();
                    let at = self.buffer_addr(req.paddr) as usize;
                    self.log.loads += 1;
                    self.log.bytes_read += u64::from(req.size);
                    let ret = MemoryReturn::from_request(&req, &self.data[at..at + req.size as usize]);
                    self.return_network.write(ret, bank_index);
                }
                MemOp::Store => {
                    let req = self.banks[bank_index].data_pipeline.read();
                    let at = self.buffer_addr(req.paddr) as usize;
                    self.log.stores += 1;
                    self.log.bytes_written += u64::from(req.size);
                    self.data[at..at + req.size as usize].copy_from_slice(req.payload());
                }
                _ => panic!("scratch buffer does not service {op:?}"),
            }
        }

        self.return_network.clock();
    }

    fn reset(&mut self) {
        self.log.reset();
    }
}

impl MemUnit for UnitBuffer {
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
