//! Partition/slice memory crossbar unit.
//!
//! Routes client requests to one of `partitions * slices` upstream ports
//! (one partition per upstream unit, `slices` ports within it) and routes
//! returns back to the issuing client. The partition bits are stripped from
//! the address on the way up and re-injected on the way down, so each
//! upstream unit sees a dense local address space. The client's port index
//! is pushed onto the destination bit-stack on the request path and popped
//! on the return path; that stamp is what makes the return find its way
//! back through the switch.

use super::ports::{MemHandle, MemUnit};
use super::transaction::{MemoryRequest, MemoryReturn};
use crate::common::bits::log2i;
use crate::common::Paddr;
use crate::net::Crossbar;
use crate::sim::Unit;

/// Crossbar unit configuration.
pub struct MemCrossbarConfig {
    /// Number of client ports.
    pub num_clients: usize,
    /// Number of upstream partitions (one unit each).
    pub num_partitions: usize,
    /// Byte stride of the partition interleave.
    pub partition_stride: u64,
    /// Number of ports (slices) per partition.
    pub num_slices: usize,
    /// Byte stride of the slice interleave within a partition.
    pub slice_stride: u64,
    /// Upstream units, one per partition.
    pub mem_highers: Vec<MemHandle>,
}

/// Partition/slice switch between clients and upstream memory units.
pub struct UnitMemCrossbar {
    num_partitions: u64,
    partition_stride: u64,
    num_slices: u64,
    slice_stride: u64,
    port_bits: u32,

    request_network: Crossbar<MemoryRequest>,
    return_network: Crossbar<MemoryReturn>,
    request_regs: Vec<Option<MemoryRequest>>,
    return_regs: Vec<Option<MemoryReturn>>,
    mem_highers: Vec<MemHandle>,
}

impl UnitMemCrossbar {
    /// Creates the crossbar from its configuration.
    pub fn new(config: MemCrossbarConfig) -> Self {
        assert!(
            config.mem_highers.len() == config.num_partitions,
            "one upstream unit per partition"
        );
        let lanes = config.num_partitions * config.num_slices;
        Self {
            num_partitions: config.num_partitions as u64,
            partition_stride: config.partition_stride,
            num_slices: config.num_slices as u64,
            slice_stride: config.slice_stride,
            port_bits: log2i((config.num_clients as u64).next_power_of_two()).max(1),
            request_network: Crossbar::with_depths(config.num_clients, lanes, 64, 64),
            return_network: Crossbar::with_depths(lanes, config.num_clients, 64, 64),
            request_regs: vec![None; lanes],
            return_regs: vec![None; lanes],
            mem_highers: config.mem_highers,
        }
    }

    fn strip_partition_bits(&self, paddr: Paddr) -> Paddr {
        (paddr / self.partition_stride / self.num_partitions) * self.partition_stride
            + (paddr % self.partition_stride)
    }

    fn inject_partition_bits(&self, paddr: Paddr, partition: u64) -> Paddr {
        (paddr / self.partition_stride * self.num_partitions + partition) * self.partition_stride
            + (paddr % self.partition_stride)
    }
}

impl Unit for UnitMemCrossbar {
    fn clock_rise(&mut self) {
        let num_partitions = self.num_partitions;
        let partition_stride = self.partition_stride;
        let num_slices = self.num_slices;
        let slice_stride = self.slice_stride;
        let lane_of = move |req: &MemoryRequest| {
            let partition = req.paddr / partition_stride % num_partitions;
            let local = (req.paddr / partition_stride / num_partitions) * partition_stride
                + (req.paddr % partition_stride);
            let slice = local / slice_stride % num_slices;
            (partition * num_slices + slice) as usize
        };
        // Two arbitration rounds per tick keep the switch from becoming the
        // bottleneck at full port width.
        for _ in 0..2 {
            self.request_network.clock(lane_of);
        }

        for lane in 0..self.request_regs.len() {
            if !self.request_network.is_read_valid(lane) || self.request_regs[lane].is_some() {
                continue;
            }
            self.request_regs[lane] = Some(self.request_network.read(lane));
        }

        for lane in 0..self.return_regs.len() {
            let partition = lane / self.num_slices as usize;
            let slice = lane % self.num_slices as usize;
            if self.return_regs[lane].is_some()
                || !self.mem_highers[partition].borrow().return_port_read_valid(slice)
            {
                continue;
            }
            self.return_regs[lane] = Some(self.mem_highers[partition].borrow_mut().read_return(slice));
        }
    }

    fn clock_fall(&mut self) {
        for lane in 0..self.request_regs.len() {
            let partition = lane / self.num_slices as usize;
            let slice = lane % self.num_slices as usize;
            let Some(req) = self.request_regs[lane] else {
                continue;
            };
            if !self.mem_highers[partition].borrow().request_port_write_valid(slice) {
                continue;
            }

            let mut up = req;
            up.paddr = self.strip_partition_bits(up.paddr);
            up.dst.push(u64::from(up.port), self.port_bits);
            up.port = slice as u16;
            self.mem_highers[partition].borrow_mut().write_request(up);
            self.request_regs[lane] = None;
        }

        for lane in 0..self.return_regs.len() {
            let partition = lane / self.num_slices as usize;
            let Some(ret) = self.return_regs[lane] else {
                continue;
            };
            if !self.return_network.is_write_valid(lane) {
                continue;
            }

            let mut down = ret;
            down.paddr = self.inject_partition_bits(down.paddr, partition as u64);
            down.port = down.dst.pop(self.port_bits) as u16;
            self.return_network.write(down, lane);
            self.return_regs[lane] = None;
        }

        for _ in 0..2 {
            self.return_network.clock(|ret: &MemoryReturn| ret.port as usize);
        }
    }
}

impl MemUnit for UnitMemCrossbar {
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
