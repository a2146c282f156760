//! SFU pool latency and port routing.

use std::cell::RefCell;
use std::rc::Rc;

use raysim_core::mem::transaction::SfuRequest;
use raysim_core::sim::{Simulator, Unit};
use raysim_core::units::sfu::UnitSfu;

/// Issues one request per client and waits for the echoes.
struct SfuDriver {
    sfu: Rc<RefCell<UnitSfu>>,
    sent: usize,
    num_clients: usize,
    tracker: raysim_core::common::track::WorkTracker,
    finished: bool,
    /// (cycle, port, payload) completions.
    pub completions: Vec<(u64, u16, u64)>,
    cycle: u64,
}

impl Unit for SfuDriver {
    fn clock_rise(&mut self) {
        for port in 0..self.num_clients {
            if self.sfu.borrow().return_port_read_valid(port) {
                let done = self.sfu.borrow_mut().read_return(port);
                self.completions.push((self.cycle, done.port, done.payload));
            }
        }
        if !self.finished && self.completions.len() == self.num_clients {
            self.finished = true;
            self.tracker.decr();
        }
    }

    fn clock_fall(&mut self) {
        while self.sent < self.num_clients {
            let port = self.sent as u16;
            if !self.sfu.borrow().request_port_write_valid(port as usize) {
                break;
            }
            self.sfu.borrow_mut().write_request(SfuRequest {
                port,
                dst: port,
                payload: 100 + u64::from(port),
            });
            self.sent += 1;
        }
        self.cycle += 1;
    }
}

#[test]
fn completions_return_to_their_port_after_latency() {
    let mut sim = Simulator::new();
    let tracker = sim.tracker();
    tracker.incr();

    let sfu = Rc::new(RefCell::new(UnitSfu::new(2, 6, 4)));
    let driver = Rc::new(RefCell::new(SfuDriver {
        sfu: sfu.clone(),
        sent: 0,
        num_clients: 4,
        tracker,
        finished: false,
        completions: Vec::new(),
        cycle: 0,
    }));

    sim.register_unit(sfu.clone());
    sim.register_unit(driver.clone());
    sim.execute(0, |_| {});

    let driver = driver.borrow();
    assert_eq!(driver.completions.len(), 4);
    for &(cycle, port, payload) in &driver.completions {
        assert_eq!(payload, 100 + u64::from(port));
        assert!(cycle >= 6, "completion at {cycle} beat the pipeline latency");
    }
}
