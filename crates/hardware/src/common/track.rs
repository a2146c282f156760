//! Shared units-executing counter.
//!
//! Every unit that can hold in-flight work gets a clone of the tracker at
//! construction. A unit increments on its first activity and decrements when
//! it goes quiescent; the kernel terminates the run when the count reaches
//! zero after a tick. The kernel itself owns only the check, never the
//! increments.

use std::cell::Cell;
use std::rc::Rc;

/// Cloneable handle on the global units-executing counter.
#[derive(Clone, Default, Debug)]
pub struct WorkTracker(Rc<Cell<i64>>);

impl WorkTracker {
    /// Creates a fresh tracker with no outstanding work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks one more unit as executing.
    #[inline]
    pub fn incr(&self) {
        self.0.set(self.0.get() + 1);
    }

    /// Marks one unit as quiescent.
    ///
    /// Going negative means a unit decremented without a matching increment,
    /// which is a bookkeeping bug in that unit.
    #[inline]
    pub fn decr(&self) {
        let next = self.0.get() - 1;
        assert!(next >= 0, "units-executing counter underflow");
        self.0.set(next);
    }

    /// Returns the number of units still executing.
    #[inline]
    pub fn outstanding(&self) -> i64 {
        self.0.get()
    }

    /// Returns `true` when no unit holds in-flight work.
    #[inline]
    pub fn idle(&self) -> bool {
        self.0.get() == 0
    }
}
