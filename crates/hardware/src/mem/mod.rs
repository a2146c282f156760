//! Memory hierarchy model.
//!
//! Everything between the TP ports and the DRAM pins lives here:
//! 1. **Transactions:** the uniform request/return records (`transaction`).
//! 2. **Ports:** the memory-unit port contract, the standard request and
//!    return networks, and the address map (`ports`).
//! 3. **Buffer:** banked on-chip scratch SRAM (`buffer`).
//! 4. **Crossbar unit:** the partition/slice switch between TMs and L2
//!    partitions that stamps the destination bit-stack (`crossbar`).
//! 5. **Caches:** blocking and non-blocking banked caches with MSHR files
//!    (`cache`).
//! 6. **DRAM:** the address-mapped channel model with per-command timing,
//!    refresh, and power states (`dram`).

/// Banked on-chip scratch buffer unit.
pub mod buffer;
/// Blocking and non-blocking caches.
pub mod cache;
/// Partition/slice memory crossbar unit.
pub mod crossbar;
/// DRAM channel model.
pub mod dram;
/// Port contract, standard networks, and the address map.
pub mod ports;
/// Request and return transaction records.
pub mod transaction;

pub use ports::{MemHandle, MemUnit};
pub use transaction::{MemOp, MemoryRequest, MemoryReturn, SfuRequest, MAX_PAYLOAD};
