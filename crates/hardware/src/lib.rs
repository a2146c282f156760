//! Cycle-accurate simulator for a many-core ray-tracing accelerator.
//!
//! This crate models an array of scalar thread processors grouped into
//! thread modules, their cache hierarchy, the DRAM channels behind it, and
//! the ray-traversal engines layered on top. It provides:
//! 1. **Kernel:** unit registry and the two-phase (rise/fall) clock with a
//!    cooperative termination condition.
//! 2. **Interconnects:** pipelines, FIFOs, cascades, and crossbars, all
//!    speaking one four-operation contract with back-pressure and
//!    round-robin fairness.
//! 3. **Memory:** blocking and non-blocking MSHR caches, a scratch buffer,
//!    a partition crossbar, and an address-mapped DRAM model with
//!    per-command timing, refresh, and power states.
//! 4. **Traversal engines:** the direct RT core, and the streaming engine
//!    built from the treelet RT core, TM staging buffers, the stream
//!    scheduler, and the scene buffer.
//! 5. **Support:** configuration (JSON machine config, YAML DRAM tables)
//!    and per-unit statistics.

/// Common types: addresses, bit manipulation, arbitration, work tracking.
pub mod common;
/// Simulator configuration and configuration errors.
pub mod config;
/// Memory hierarchy: transactions, ports, buffer, caches, DRAM.
pub mod mem;
/// Interconnect primitives.
pub mod net;
/// Ray-traversal data model: geometry, BVH views, treelets, buckets.
pub mod rt;
/// Simulation kernel.
pub mod sim;
/// Statistics aggregation and reporting.
pub mod stats;
/// Co-processor units: SFU, atomic regfile, schedulers, RT cores.
pub mod units;

/// Root configuration type; use `Config::default()` or parse from JSON.
pub use crate::config::Config;
/// The discrete-event simulator; register units, then `execute`.
pub use crate::sim::Simulator;
/// Aggregated run statistics.
pub use crate::stats::SimStats;
