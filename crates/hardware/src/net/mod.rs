//! Interconnect primitives.
//!
//! Units communicate exclusively through the typed primitives in this
//! module, all of which expose the same four-operation contract:
//! `is_write_valid` / `write` on clock fall, `is_read_valid` / `peek` /
//! `read` on clock rise, plus an owner-driven `clock` that advances internal
//! state between the two. The module provides:
//! 1. **Channels:** latency pipelines, bounded FIFOs, FIFO arrays, and
//!    register arrays (`channel`).
//! 2. **Switches:** cascades, decascades, crossbars, and the cascaded
//!    crossbar that bounds arbiter fan-in (`xbar`).
//!
//! Three invariants hold across every primitive: back-pressure (a write is
//! refused while the target buffer is full), conservation (payloads are
//! neither created nor destroyed), and round-robin fairness on every grant.

/// Latency pipelines, FIFOs, and register arrays.
pub mod channel;
/// Cascades, crossbars, and the cascaded crossbar.
pub mod xbar;

pub use channel::{Fifo, FifoArray, Pipeline, RegisterArray};
pub use xbar::{Cascade, CascadedCrossbar, Crossbar, Decascade};
