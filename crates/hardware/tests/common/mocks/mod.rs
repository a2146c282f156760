//! Mock units for driving the real ones.

/// Scripted memory clients.
pub mod client;
/// Fixed-latency backing memory.
pub mod memory;
