//! Tile scheduler: per-TM hand-out of contiguous work-index ranges.
//!
//! Fetch threads on a TM request one work index at a time. The scheduler
//! serves them from its current block of indices and, when the block is
//! exhausted, re-arms by a fetch-and-add of the block size on the global
//! counter in the atomic regfile. One scheduler instance serves one TM; its
//! TM index is its port on the regfile.

use std::cell::RefCell;
use std::rc::Rc;

use super::atomic_regfile::UnitAtomicRegfile;
use crate::mem::ports::MemUnit;
use crate::mem::transaction::{MemOp, MemoryRequest, MemoryReturn};
use crate::net::{Cascade, FifoArray};
use crate::sim::Unit;

/// Per-TM work-range dispenser.
pub struct UnitTileScheduler {
    atomic_regs: Rc<RefCell<UnitAtomicRegfile>>,

    request_network: Cascade<MemoryRequest>,
    return_network: FifoArray<MemoryReturn>,

    current: Option<MemoryRequest>,
    stalled_for_regfile: bool,

    tm_index: u16,
    block_size: u32,
    current_block: u32,
    current_offset: u32,
}

impl UnitTileScheduler {
    /// Creates the scheduler for TM `tm_index`.
    ///
    /// # Arguments
    ///
    /// * `num_tp` - Fetch-thread ports on this TM.
    /// * `tm_index` - This TM's port on the atomic regfile.
    /// * `atomic_regs` - The shared regfile.
    /// * `block_size` - Indices fetched per re-arm.
    pub fn new(
        num_tp: usize,
        tm_index: u16,
        atomic_regs: Rc<RefCell<UnitAtomicRegfile>>,
        block_size: u32,
    ) -> Self {
        Self {
            atomic_regs,
            request_network: Cascade::new(num_tp, 1),
            return_network: FifoArray::new(num_tp, 1),
            current: None,
            stalled_for_regfile: false,
            tm_index,
            block_size,
            current_block: 0,
            // Starts exhausted so the first request re-arms.
            current_offset: block_size,
        }
    }
}

impl Unit for UnitTileScheduler {
    fn clock_rise(&mut self) {
        self.request_network.clock();

        if self.stalled_for_regfile {
            let ready = self
                .atomic_regs
                .borrow()
                .return_port_read_valid(self.tm_index as usize);
            if ready {
                let ret = self
                    .atomic_regs
                    .borrow_mut()
                    .read_return(self.tm_index as usize);
                self.current_block = ret.data_u32();
                self.current_offset = 0;
                self.stalled_for_regfile = false;
            }
        } else if self.current.is_none() && self.request_network.is_read_valid(0) {
            self.current = Some(self.request_network.read(0));
        }
    }

    fn clock_fall(&mut self) {
        if !self.stalled_for_regfile {
            if let Some(request) = self.current {
                if self.current_offset == self.block_size {
                    let writable = self
                        .atomic_regs
                        .borrow()
                        .request_port_write_valid(self.tm_index as usize);
                    if writable {
                        let fetch = MemoryRequest::amo(MemOp::AmoAdd, 0, self.block_size, self.tm_index);
                        self.atomic_regs.borrow_mut().write_request(fetch);
                        self.stalled_for_regfile = true;
                    }
                } else if self.return_network.is_write_valid(request.port as usize) {
                    let index = self.current_block + self.current_offset;
                    let ret = MemoryReturn::from_request(&request, &index.to_le_bytes());
                    self.return_network.write(ret, ret.port as usize);
                    self.current_offset += 1;
                    self.current = None;
                }
            }
        }

        self.return_network.clock();
    }
}

impl MemUnit for UnitTileScheduler {
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
