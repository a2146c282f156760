//! Co-processor units.
//!
//! The units that sit beside the memory hierarchy:
//! 1. **`sfu`:** the fixed-latency special-function-unit pool.
//! 2. **`atomic_regfile`:** the globally shared read-modify-write counters.
//! 3. **`tile_scheduler`:** per-TM work-index hand-out backed by the atomic
//!    regfile.
//! 4. **`rt_core`:** the direct ray-traversal engine.
//! 5. **`treelet_rt_core`:** the streaming (treelet) ray-traversal engine.
//! 6. **`ray_staging`:** TM-resident bucket staging between the streaming
//!    cores and the stream scheduler.
//! 7. **`stream_scheduler`:** bucket coalescing, segment lifecycle, and
//!    DRAM streaming.
//! 8. **`scene_buffer`:** the on-chip treelet store fed by the scheduler's
//!    prefetches.

/// Atomic read-modify-write register file.
pub mod atomic_regfile;
/// TM-resident ray bucket staging.
pub mod ray_staging;
/// Direct RT core.
pub mod rt_core;
/// On-chip treelet store.
pub mod scene_buffer;
/// Fixed-latency SFU pool.
pub mod sfu;
/// Stream scheduler.
pub mod stream_scheduler;
/// Tile scheduler.
pub mod tile_scheduler;
/// Streaming (treelet) RT core.
pub mod treelet_rt_core;

pub use atomic_regfile::UnitAtomicRegfile;
pub use ray_staging::UnitRayStagingBuffer;
pub use rt_core::UnitRtCore;
pub use scene_buffer::UnitSceneBuffer;
pub use sfu::UnitSfu;
pub use stream_scheduler::UnitStreamScheduler;
pub use tile_scheduler::UnitTileScheduler;
pub use treelet_rt_core::UnitTreeletRtCore;
