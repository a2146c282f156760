//! Fixed-latency backing memory.
//!
//! Stands in for the levels above the unit under test: every accepted load
//! returns its data exactly `latency` ticks later on the issuing port, and
//! stores are absorbed immediately. Accepted loads are counted so tests
//! can assert how much traffic actually reached memory.

use std::collections::VecDeque;

use raysim_core::mem::ports::MemUnit;
use raysim_core::mem::transaction::{MemOp, MemoryRequest, MemoryReturn};
use raysim_core::sim::Unit;

struct InFlight {
    ready_at: u64,
    ret: MemoryReturn,
}

/// Backing memory with one return stream per port.
pub struct MockMemory {
    data: Vec<u8>,
    latency: u64,
    cycle: u64,
    ports: Vec<VecDeque<InFlight>>,
    /// Loads accepted.
    pub loads: u64,
    /// Stores accepted.
    pub stores: u64,
}

impl MockMemory {
    /// Creates a memory of `size` bytes with `num_ports` ports.
    pub fn new(size: usize, num_ports: usize, latency: u64) -> Self {
        Self {
            data: vec![0; size],
            latency,
            cycle: 0,
            ports: (0..num_ports).map(|_| VecDeque::new()).collect(),
            loads: 0,
            stores: 0,
        }
    }

    /// Seeds the backing store.
    pub fn load_image(&mut self, image: &[u8], at: u64) {
        self.data[at as usize..at as usize + image.len()].copy_from_slice(image);
    }

    /// Reads the backing store directly.
    pub fn bytes(&self, at: u64, len: usize) -> &[u8] {
        &self.data[at as usize..at as usize + len]
    }
}

impl Unit for MockMemory {
    fn clock_rise(&mut self) {}

    fn clock_fall(&mut self) {
        self.cycle += 1;
    }
}

impl MemUnit for MockMemory {
    fn request_port_write_valid(&self, _port: usize) -> bool {
        true
    }

    fn write_request(&mut self, request: MemoryRequest) {
        let at = request.paddr as usize;
        match request.op {
            MemOp::Load => {
                self.loads += 1;
                let ret = MemoryReturn::from_request(&request, &self.data[at..at + request.size as usize]);
                self.ports[request.port as usize].push_back(InFlight {
                    ready_at: self.cycle + self.latency,
                    ret,
                });
            }
            MemOp::Store => {
                self.stores += 1;
                self.data[at..at + request.size as usize].copy_from_slice(request.payload());
            }
            MemOp::Prefetch => {}
            other => panic!("mock memory cannot service {other:?}"),
        }
    }

    fn return_port_read_valid(&self, port: usize) -> bool {
        self.ports[port]
            .front()
            .is_some_and(|f| f.ready_at <= self.cycle)
    }

    fn peek_return(&self, port: usize) -> &MemoryReturn {
        &self.ports[port].front().expect("no return pending").ret
    }

    fn read_return(&mut self, port: usize) -> MemoryReturn {
        assert!(self.return_port_read_valid(port), "return not ready");
        self.ports[port].pop_front().expect("checked above").ret
    }
}
