//! Atomic read-modify-write register file.
//!
//! A small bank of 32-bit counters serviced one request per tick from any
//! client. Every atomic returns the value the register held before the
//! update; plain loads return it unchanged, and stores are absorbed. The
//! tile schedulers use register zero as the global work counter.

use crate::mem::ports::{MemUnit, ReturnCascade};
use crate::mem::transaction::{MemOp, MemoryRequest, MemoryReturn};
use crate::net::Cascade;
use crate::sim::Unit;

/// Number of 32-bit registers in the file.
pub const NUM_ATOMIC_REGS: usize = 32;

/// Atomically updated counter file.
pub struct UnitAtomicRegfile {
    /// Register contents; index derives from the request address.
    pub iregs: [u32; NUM_ATOMIC_REGS],

    current: Option<MemoryRequest>,
    request_network: Cascade<MemoryRequest>,
    return_network: ReturnCascade,
}

impl UnitAtomicRegfile {
    /// Creates the file with `num_clients` ports, all registers zero.
    pub fn new(num_clients: usize) -> Self {
        Self {
            iregs: [0; NUM_ATOMIC_REGS],
            current: None,
            request_network: Cascade::new(num_clients, 1),
            return_network: ReturnCascade::new(1, num_clients),
        }
    }
}

impl Unit for UnitAtomicRegfile {
    fn clock_rise(&mut self) {
        self.request_network.clock();

        if self.current.is_none() && self.request_network.is_read_valid(0) {
            self.current = Some(self.request_network.read(0));
        }
    }

    fn clock_fall(&mut self) {
        if let Some(request) = self.current {
            if request.op == MemOp::Store || self.return_network.is_write_valid(0) {
                let reg_index = ((request.paddr >> 2) & 0x1f) as usize;
                let operand = request.data_u32();
                let prior = self.iregs[reg_index];

                match request.op {
                    MemOp::Store => self.iregs[reg_index] = operand,
                    MemOp::Load | MemOp::Prefetch => {}
                    MemOp::AmoAdd => self.iregs[reg_index] = prior.wrapping_add(operand),
                    MemOp::AmoAnd => self.iregs[reg_index] &= operand,
                    MemOp::AmoOr => self.iregs[reg_index] |= operand,
                    MemOp::AmoXor => self.iregs[reg_index] ^= operand,
                    MemOp::AmoMin => {
                        self.iregs[reg_index] = (prior as i32).min(operand as i32) as u32;
                    }
                    MemOp::AmoMax => {
                        self.iregs[reg_index] = (prior as i32).max(operand as i32) as u32;
                    }
                    MemOp::AmoMinu => self.iregs[reg_index] = prior.min(operand),
                    MemOp::AmoMaxu => self.iregs[reg_index] = prior.max(operand),
                }

                if request.op != MemOp::Store {
                    let ret = MemoryReturn::from_request(&request, &prior.to_le_bytes());
                    self.return_network.write(ret, 0);
                }
                self.current = None;
            }
        }

        self.return_network.clock();
    }
}

impl MemUnit for UnitAtomicRegfile {
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
