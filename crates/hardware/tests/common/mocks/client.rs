//! Scripted memory clients.
//!
//! `ScriptedClient` injects a fixed schedule of requests into one memory
//! unit and records every return with its arrival tick. It participates in
//! the units-executing protocol so `Simulator::execute` runs exactly until
//! the last return lands.

use std::cell::RefCell;
use std::rc::Rc;

use raysim_core::common::track::WorkTracker;
use raysim_core::common::Cycles;
use raysim_core::mem::ports::{MemHandle, MemUnit};
use raysim_core::mem::transaction::{MemoryRequest, MemoryReturn};
use raysim_core::sim::Unit;

/// A request client that follows a (tick, request) script.
pub struct ScriptedClient {
    target: MemHandle,
    /// Ports on the target this client listens on.
    ports: Vec<usize>,
    script: Vec<(Cycles, MemoryRequest)>,
    next: usize,
    cycle: Cycles,
    outstanding: usize,
    expects_return: fn(&MemoryRequest) -> bool,
    tracker: WorkTracker,
    finished: bool,
    /// Returns observed, with arrival tick.
    pub returns: Vec<(Cycles, MemoryReturn)>,
}

impl ScriptedClient {
    /// Creates a client over `target`, listening on `ports`.
    ///
    /// The script must be sorted by tick. `expects_return` names which
    /// requests produce a return (loads and atomics, typically).
    pub fn new(
        target: MemHandle,
        ports: Vec<usize>,
        script: Vec<(Cycles, MemoryRequest)>,
        tracker: WorkTracker,
    ) -> Rc<RefCell<Self>> {
        assert!(script.windows(2).all(|w| w[0].0 <= w[1].0), "script out of order");
        // The client counts as executing for its whole scripted lifetime,
        // so the run cannot terminate between scheduled injections.
        tracker.incr();
        Rc::new(RefCell::new(Self {
            target,
            ports,
            script,
            next: 0,
            cycle: 0,
            outstanding: 0,
            expects_return: |req| req.op.has_return(),
            tracker,
            finished: false,
            returns: Vec::new(),
        }))
    }

    /// Returns `true` once every scripted request was injected and every
    /// expected return arrived.
    pub fn done(&self) -> bool {
        self.next == self.script.len() && self.outstanding == 0
    }
}

impl Unit for ScriptedClient {
    fn clock_rise(&mut self) {
        for &port in &self.ports {
            while self.target.borrow().return_port_read_valid(port) {
                let ret = self.target.borrow_mut().read_return(port);
                self.returns.push((self.cycle, ret));
                assert!(self.outstanding > 0, "return without a matching request");
                self.outstanding -= 1;
            }
        }
        self.finish_if_done();
    }

    fn clock_fall(&mut self) {
        while self.next < self.script.len() && self.script[self.next].0 <= self.cycle {
            let request = self.script[self.next].1;
            if !self.target.borrow().request_port_write_valid(request.port as usize) {
                break;
            }
            if (self.expects_return)(&request) {
                self.outstanding += 1;
            }
            self.target.borrow_mut().write_request(request);
            self.next += 1;
        }
        self.cycle += 1;
        self.finish_if_done();
    }
}

impl ScriptedClient {
    fn finish_if_done(&mut self) {
        if !self.finished && self.next == self.script.len() && self.outstanding == 0 {
            self.finished = true;
            self.tracker.decr();
        }
    }
}
