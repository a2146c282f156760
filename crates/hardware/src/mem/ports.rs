//! Memory-unit port contract and standard networks.
//!
//! This module provides:
//! 1. **`MemUnit`:** the port contract every memory-servicing unit exposes.
//!    Request writes are legal on clock fall only; return reads on clock
//!    rise only. A refused write is back-pressure, and the source retries
//!    next tick.
//! 2. **Standard return networks:** the port-routed return crossbar and
//!    cascade, plus the request cascade for units whose banks are fed
//!    round-robin. Request-side bank striding lives with each unit (caches
//!    extract by mask, DRAM by the channel decode).
//! 3. **`MemoryMap`:** sorted address ranges resolving a physical address
//!    to the unit and port that service it; used by the wiring layer and
//!    the request sources.

use std::cell::RefCell;
use std::rc::Rc;

use super::transaction::{MemoryRequest, MemoryReturn};
use crate::common::Paddr;
use crate::net::{Cascade, CascadedCrossbar, Decascade};

/// Port contract for units that service memory transactions.
pub trait MemUnit {
    /// Returns `true` when `port` can accept a request this tick. Clock
    /// fall only.
    fn request_port_write_valid(&self, port: usize) -> bool;
    /// Writes a request on the port named by `request.port`. Clock fall
    /// only.
    fn write_request(&mut self, request: MemoryRequest);
    /// Returns `true` when `port` holds a readable return. Clock rise only.
    fn return_port_read_valid(&self, port: usize) -> bool;
    /// Returns a reference to the return at `port`. Clock rise only.
    fn peek_return(&self, port: usize) -> &MemoryReturn;
    /// Removes and returns the return at `port`. Clock rise only.
    fn read_return(&mut self, port: usize) -> MemoryReturn;
}

/// Shared handle on a memory-servicing unit.
pub type MemHandle = Rc<RefCell<dyn MemUnit>>;

/// Return crossbar routing each return to the port it names.
pub struct ReturnXbar {
    xbar: CascadedCrossbar<MemoryReturn>,
}

impl ReturnXbar {
    /// Creates a return crossbar from `banks` sources into `ports` sinks.
    pub fn new(banks: usize, ports: usize, width: usize) -> Self {
        Self {
            xbar: CascadedCrossbar::new(banks, ports, width, width),
        }
    }

    /// Runs one arbitration round.
    pub fn clock(&mut self) {
        self.xbar.clock(|ret: &MemoryReturn| ret.port as usize);
    }

    /// Returns `true` when bank `index` can emit a return this tick.
    pub fn is_write_valid(&self, index: usize) -> bool {
        self.xbar.is_write_valid(index)
    }

    /// Writes a return from bank `index`.
    pub fn write(&mut self, ret: MemoryReturn, index: usize) {
        assert!(
            (ret.port as usize) < self.xbar.num_sinks(),
            "return port {} exceeds sink fan-out {}",
            ret.port,
            self.xbar.num_sinks()
        );
        self.xbar.write(ret, index);
    }

    /// Returns `true` when client `port` holds a readable return.
    pub fn is_read_valid(&self, port: usize) -> bool {
        self.xbar.is_read_valid(port)
    }

    /// Returns a reference to the return at client `port`.
    pub fn peek(&self, port: usize) -> &MemoryReturn {
        self.xbar.peek(port)
    }

    /// Removes and returns the return at client `port`.
    pub fn read(&mut self, port: usize) -> MemoryReturn {
        self.xbar.read(port)
    }
}

/// Request cascade feeding banks round-robin from grouped ports.
pub type RequestCascade = Cascade<MemoryRequest>;

/// Return decascade routing each return to the port it names.
pub struct ReturnCascade {
    net: Decascade<MemoryReturn>,
}

impl ReturnCascade {
    /// Creates a return decascade from `banks` sources into `ports` sinks.
    pub fn new(banks: usize, ports: usize) -> Self {
        Self {
            net: Decascade::new(banks, ports),
        }
    }

    /// Runs one routing round.
    pub fn clock(&mut self) {
        self.net.clock(|ret: &MemoryReturn| ret.port as usize);
    }

    /// Returns `true` when bank `index` can emit a return this tick.
    pub fn is_write_valid(&self, index: usize) -> bool {
        self.net.is_write_valid(index)
    }

    /// Writes a return from bank `index`.
    pub fn write(&mut self, ret: MemoryReturn, index: usize) {
        assert!(
            (ret.port as usize) < self.net.num_sinks(),
            "return port {} exceeds sink fan-out {}",
            ret.port,
            self.net.num_sinks()
        );
        self.net.write(ret, index);
    }

    /// Returns `true` when client `port` holds a readable return.
    pub fn is_read_valid(&self, port: usize) -> bool {
        self.net.is_read_valid(port)
    }

    /// Returns a reference to the return at client `port`.
    pub fn peek(&self, port: usize) -> &MemoryReturn {
        self.net.peek(port)
    }

    /// Removes and returns the return at client `port`.
    pub fn read(&mut self, port: usize) -> MemoryReturn {
        self.net.read(port)
    }
}

/// One contiguous range mapped to a unit's port window.
#[derive(Clone)]
pub struct MemoryMapping {
    /// Unit servicing the range.
    pub unit: MemHandle,
    /// First port index within the unit reserved for this mapping.
    pub port_index: u16,
    /// Number of ports reserved for this mapping.
    pub num_ports: u16,
    /// First globally unique port id for this mapping.
    pub port_id: u16,
}

/// Sorted address ranges resolving physical addresses to units.
#[derive(Default)]
pub struct MemoryMap {
    ranges: Vec<(Paddr, Option<usize>)>,
    /// Registered mappings in insertion order.
    pub mappings: Vec<MemoryMapping>,
    /// Total ports across all mappings.
    pub total_ports: u16,
}

impl MemoryMap {
    /// Registers `unit` as the owner of addresses starting at `base`.
    ///
    /// Ranges extend to the next registered base; register a `None` unit to
    /// terminate a range. Identical (unit, port window) pairs registered at
    /// several bases share one mapping entry.
    pub fn add_unit(&mut self, base: Paddr, unit: Option<MemHandle>, port_index: u16, num_ports: u16) {
        let at = self.ranges.partition_point(|(addr, _)| *addr < base);

        let Some(unit) = unit else {
            self.ranges.insert(at, (base, None));
            return;
        };

        let candidate = MemoryMapping {
            unit,
            port_index,
            num_ports,
            port_id: 0,
        };
        let idx = self
            .mappings
            .iter()
            .position(|m| {
                Rc::ptr_eq(&m.unit, &candidate.unit)
                    && m.port_index == candidate.port_index
                    && m.num_ports == candidate.num_ports
            })
            .unwrap_or_else(|| {
                self.mappings.push(candidate);
                self.mappings.len() - 1
            });
        self.ranges.insert(at, (base, Some(idx)));

        self.total_ports = 0;
        for mapping in &mut self.mappings {
            mapping.port_id = self.total_ports;
            self.total_ports += mapping.num_ports;
        }
    }

    /// Returns the mapping index owning `paddr`, or `None` for a hole.
    pub fn mapping_index(&self, paddr: Paddr) -> Option<usize> {
        if self.ranges.is_empty() || paddr < self.ranges[0].0 {
            return None;
        }
        let at = self.ranges.partition_point(|(addr, _)| *addr <= paddr) - 1;
        self.ranges[at].1
    }

    /// Returns the mapping owning `paddr`; a hole is fatal.
    pub fn mapping(&self, paddr: Paddr) -> &MemoryMapping {
        let idx = self
            .mapping_index(paddr)
            .unwrap_or_else(|| panic!("unmapped physical address {paddr:#x}"));
        &self.mappings[idx]
    }

    /// Returns the mapping index that owns the globally unique `port_id`.
    pub fn mapping_index_for_port(&self, port_id: u16) -> usize {
        debug_assert!(port_id < self.total_ports);
        self.mappings.partition_point(|m| m.port_id <= port_id) - 1
    }
}
