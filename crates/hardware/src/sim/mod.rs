//! Simulation kernel.
//!
//! Provides the unit registry and the two-phase clock: every registered
//! unit sees `clock_rise` (read inputs) and then `clock_fall` (write
//! outputs) once per tick, with a total ordering between the two phases.

pub mod simulator;

pub use simulator::{Simulator, Unit, UnitHandle};
