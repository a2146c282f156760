//! Common types and helpers shared across the simulator.
//!
//! This module provides the foundation types used by every unit. It contains:
//! 1. **Address and cycle aliases:** `Paddr` and `Cycles`.
//! 2. **Bit manipulation:** masks, software bit-extract, and the destination
//!    bit-stacks carried by every transaction.
//! 3. **Arbitration:** the round-robin arbiter used by crossbars and cascades.
//! 4. **Work tracking:** the shared units-executing counter that drives the
//!    kernel's termination condition.

/// Round-robin arbitration over a pending-request mask.
pub mod arbiter;
/// Bit masks, software `pext`, and destination bit-stacks.
pub mod bits;
/// Shared units-executing counter for simulation termination.
pub mod track;

pub use arbiter::RoundRobinArbiter;
pub use bits::{BitStack27, BitStack58};
pub use track::WorkTracker;

/// A physical address in the simulated machine.
///
/// The simulator models a single flat physical address space; all routing
/// (bank select, channel select, DRAM decode) is derived from this value by
/// bit extraction.
pub type Paddr = u64;

/// A point in simulated time, measured in core clock ticks.
pub type Cycles = u64;
