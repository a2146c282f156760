//! Blocking and non-blocking banked caches.
//!
//! Both cache flavors share the same shell: a cascaded crossbar routes
//! client requests into banks by a configurable (possibly non-contiguous)
//! bank-select mask, each bank probes a set-associative tag array, and a
//! return crossbar routes responses back to the issuing port. They differ
//! in miss handling:
//! 1. **Blocking** (`blocking`): a bank with an outstanding miss stalls
//!    until the fill returns.
//! 2. **Non-blocking** (`nonblocking`): each bank owns a small file of
//!    miss-status holding registers; misses to the same line coalesce, and
//!    MSHR exhaustion back-pressures the input port.
//!
//! Invariant held by both: a line address is represented in either the tag
//! array or an MSHR, never both. Fills install the line and retire the
//! MSHR in the same tick.

/// Blocking cache unit.
pub mod blocking;
/// Non-blocking cache unit with MSHR files.
pub mod nonblocking;

pub use blocking::UnitBlockingCache;
pub use nonblocking::UnitNonBlockingCache;

use serde::Serialize;

use super::ports::MemHandle;
use crate::common::bits::{log2i, pext};
use crate::common::Paddr;

/// Cache geometry and wiring.
#[derive(Clone)]
pub struct CacheConfig {
    /// Total capacity in bytes.
    pub size: u64,
    /// Ways per set.
    pub associativity: usize,
    /// Line size in bytes (the unit of transfer with the next level).
    pub block_size: u64,
    /// Number of banks.
    pub num_banks: usize,
    /// Bank-select bit mask applied to the physical address; zero selects
    /// the bits directly above the block offset.
    pub bank_select_mask: u64,
    /// Number of client ports.
    pub num_ports: usize,
    /// MSHRs per bank (non-blocking only).
    pub num_mshr: usize,
    /// Hit latency in ticks.
    pub latency: u32,
    /// Internal crossbar arbiter width.
    pub crossbar_width: usize,
    /// Keep retired MSHRs addressable for one extra tick. Accepted but
    /// inert; the shipped configurations leave it off.
    pub retired_lfb_check: bool,
    /// Next level of the hierarchy.
    pub mem_higher: MemHandle,
    /// First port index on the next level reserved for this cache.
    pub mem_higher_port_offset: usize,
    /// Stride between consecutive bank ports on the next level.
    pub mem_higher_port_stride: usize,
}

/// Address split shared by both cache flavors.
#[derive(Clone, Copy)]
pub(crate) struct LineAddressing {
    pub block_size: u64,
    pub num_sets: u64,
    pub bank_mask: u64,
    pub num_banks: u64,
}

impl LineAddressing {
    pub fn new(config: &CacheConfig) -> Self {
        let num_lines = config.size / config.block_size;
        let num_sets = num_lines / config.associativity as u64;
        assert!(num_sets.is_power_of_two(), "cache set count must be a power of two");
        let bank_mask = if config.bank_select_mask != 0 {
            config.bank_select_mask
        } else {
            (config.num_banks as u64 - 1) << log2i(config.block_size)
        };
        Self {
            block_size: config.block_size,
            num_sets,
            bank_mask,
            num_banks: config.num_banks as u64,
        }
    }

    #[inline]
    pub fn bank(&self, paddr: Paddr) -> usize {
        (pext(paddr, self.bank_mask) % self.num_banks) as usize
    }

    #[inline]
    pub fn line_paddr(&self, paddr: Paddr) -> Paddr {
        paddr & !(self.block_size - 1)
    }

    #[inline]
    pub fn set(&self, paddr: Paddr) -> u64 {
        (paddr / self.block_size) % self.num_sets
    }

    #[inline]
    pub fn tag(&self, paddr: Paddr) -> u64 {
        paddr / self.block_size / self.num_sets
    }
}

/// Hit/miss and traffic counters for a cache.
#[derive(Clone, Copy, Default, Serialize)]
pub struct CacheLog {
    /// Requests that hit in the tag array.
    pub hits: u64,
    /// Requests that allocated a new MSHR or stalled a blocking bank.
    pub misses: u64,
    /// Requests that merged into an MSHR already fetching their line.
    pub half_misses: u64,
    /// Ticks an input was refused because every MSHR was busy.
    pub mshr_stalls: u64,
    /// Dirty lines written back to the next level.
    pub writebacks: u64,
    /// Bytes returned to clients.
    pub bytes_read: u64,
    /// Bytes written by client stores.
    pub bytes_written: u64,
}

impl CacheLog {
    /// Clears every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Adds `other` into this log.
    pub fn accumulate(&mut self, other: &Self) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.half_misses += other.half_misses;
        self.mshr_stalls += other.mshr_stalls;
        self.writebacks += other.writebacks;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
    }

    /// Returns the hit rate over all tag probes.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.half_misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// One tag-array entry.
#[derive(Clone, Copy, Default)]
pub(crate) struct Line {
    pub tag: u64,
    pub valid: bool,
    pub dirty: bool,
    pub lru: u64,
}
